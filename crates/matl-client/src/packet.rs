//! Engine.IO / Socket.IO text packet codec.
//!
//! The interpreter speaks Socket.IO (protocol v5) over an Engine.IO v4
//! WebSocket transport. Every WebSocket text frame carries exactly one
//! Engine.IO packet:
//!
//! ```text
//! <engine type digit>[payload]
//! ```
//!
//! Engine.IO `message` packets (type `4`) carry one Socket.IO packet:
//!
//! ```text
//! <socket type digit>[<namespace>,][<ack id>][<json array or object>]
//! ```
//!
//! So an event with an acknowledgement request on the default namespace looks
//! like `421["submit",{...}]` on the wire, and the server's acknowledgement
//! for it like `431[...]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace used when a packet does not name one.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Errors produced while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown engine.io packet type: {0:?}")]
    UnknownEngineType(char),

    #[error("unknown socket.io packet type: {0:?}")]
    UnknownSocketType(char),

    #[error("binary socket.io packets are not supported")]
    Binary,

    #[error("invalid packet payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Handshake data sent by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl OpenInfo {
    /// How long the link may stay silent before it is considered lost.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// One Engine.IO packet (one WebSocket text frame).
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    /// Carries an encoded Socket.IO packet.
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(rest.to_string())),
            '3' => Ok(EnginePacket::Pong(rest.to_string())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            k => Err(PacketError::UnknownEngineType(k)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(info) => {
                let mut handshake = serde_json::json!({
                    "sid": info.sid,
                    "upgrades": info.upgrades,
                    "pingInterval": info.ping_interval,
                    "pingTimeout": info.ping_timeout,
                });
                if let Some(max_payload) = info.max_payload {
                    handshake["maxPayload"] = max_payload.into();
                }
                format!("0{}", handshake)
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data),
            EnginePacket::Pong(data) => format!("3{}", data),
            EnginePacket::Message(data) => format!("4{}", data),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// One Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    /// `data[0]` is the event name, the rest are its arguments.
    Event {
        namespace: String,
        id: Option<u64>,
        data: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        data: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Connect request for the default namespace.
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Event on the default namespace.
    pub fn event(name: &str, payload: Value, id: Option<u64>) -> Self {
        SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id,
            data: vec![Value::String(name.to_string()), payload],
        }
    }

    /// The event name and arguments, for `Event` packets.
    pub fn as_event(&self) -> Option<(&str, &[Value])> {
        match self {
            SocketPacket::Event { data, .. } => {
                let (name, args) = data.split_first()?;
                Some((name.as_str()?, args))
            }
            _ => None,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    fn type_digit(&self) -> char {
        match self {
            SocketPacket::Connect { .. } => '0',
            SocketPacket::Disconnect { .. } => '1',
            SocketPacket::Event { .. } => '2',
            SocketPacket::Ack { .. } => '3',
            SocketPacket::ConnectError { .. } => '4',
        }
    }

    pub fn decode(payload: &str) -> Result<Self, PacketError> {
        let mut chars = payload.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let mut rest = chars.as_str();

        match kind {
            '0'..='4' => {}
            '5' | '6' => return Err(PacketError::Binary),
            k => return Err(PacketError::UnknownSocketType(k)),
        }

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(idx) => {
                    let namespace = rest[..idx].to_string();
                    rest = &rest[idx + 1..];
                    namespace
                }
                None => {
                    let namespace = rest.to_string();
                    rest = "";
                    namespace
                }
            }
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| PacketError::Malformed(format!("ack id: {}", e)))?;
            Some(id)
        } else {
            None
        };
        rest = &rest[digits..];

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let data = into_array(data)?;
                if !matches!(data.first(), Some(Value::String(_))) {
                    return Err(PacketError::Malformed(
                        "event without a name".to_string(),
                    ));
                }
                Ok(SocketPacket::Event {
                    namespace,
                    id,
                    data,
                })
            }
            '3' => {
                let id =
                    id.ok_or_else(|| PacketError::Malformed("ack without id".to_string()))?;
                Ok(SocketPacket::Ack {
                    namespace,
                    id,
                    data: into_array(data)?,
                })
            }
            _ => Ok(SocketPacket::ConnectError { namespace, data }),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.type_digit());

        let namespace = self.namespace();
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            SocketPacket::Connect { data, .. } | SocketPacket::ConnectError { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            SocketPacket::Disconnect { .. } => {}
            SocketPacket::Event { id, data, .. } => {
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                out.push_str(&Value::Array(data.clone()).to_string());
            }
            SocketPacket::Ack { id, data, .. } => {
                out.push_str(&id.to_string());
                out.push_str(&Value::Array(data.clone()).to_string());
            }
        }

        out
    }

    /// Wrap this packet in an Engine.IO message frame.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn into_array(data: Option<Value>) -> Result<Vec<Value>, PacketError> {
    match data {
        None => Ok(Vec::new()),
        Some(Value::Array(values)) => Ok(values),
        Some(other) => Err(PacketError::Malformed(format!(
            "expected a JSON array, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let frame = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match EnginePacket::decode(frame).unwrap() {
            EnginePacket::Open(info) => {
                assert_eq!(info.sid, "abc");
                assert_eq!(info.ping_interval, 25000);
                assert_eq!(info.ping_deadline(), Duration::from_millis(45000));
                assert_eq!(info.max_payload, Some(1_000_000));
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_open_encode_decode() {
        let info = OpenInfo {
            sid: "s1".into(),
            upgrades: vec![],
            ping_interval: 100,
            ping_timeout: 50,
            max_payload: None,
        };
        let frame = EnginePacket::Open(info.clone()).encode();
        assert!(frame.starts_with('0'));
        assert_eq!(
            EnginePacket::decode(&frame).unwrap(),
            EnginePacket::Open(info)
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(
            EnginePacket::decode("2").unwrap(),
            EnginePacket::Ping(String::new())
        );
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::decode("6").unwrap(), EnginePacket::Noop);
    }

    #[test]
    fn test_unknown_engine_type() {
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(PacketError::UnknownEngineType('9'))
        ));
        assert!(matches!(EnginePacket::decode(""), Err(PacketError::Empty)));
    }

    #[test]
    fn test_decode_status_event() {
        let payload = r#"2["status",{"session":"abc","data":[{"type":"stdout","value":"1"}]}]"#;
        let packet = SocketPacket::decode(payload).unwrap();
        let (name, args) = packet.as_event().unwrap();
        assert_eq!(name, "status");
        assert_eq!(args[0]["session"], "abc");
        assert_eq!(packet.namespace(), "/");
    }

    #[test]
    fn test_encode_event_with_ack_id() {
        let packet = SocketPacket::event("submit", json!({"code": "1"}), Some(7));
        assert_eq!(packet.encode(), r#"27["submit",{"code":"1"}]"#);
        assert_eq!(packet.to_frame(), r#"427["submit",{"code":"1"}]"#);
    }

    #[test]
    fn test_decode_ack() {
        let packet = SocketPacket::decode("312[]").unwrap();
        assert_eq!(
            packet,
            SocketPacket::Ack {
                namespace: "/".into(),
                id: 12,
                data: vec![],
            }
        );
    }

    #[test]
    fn test_ack_requires_id() {
        assert!(matches!(
            SocketPacket::decode("3[]"),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn test_namespace_roundtrip() {
        let packet = SocketPacket::decode(r#"2/admin,5["kill",{"uid":"x"}]"#).unwrap();
        assert_eq!(packet.namespace(), "/admin");
        match &packet {
            SocketPacket::Event { id, .. } => assert_eq!(*id, Some(5)),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert_eq!(packet.encode(), r#"2/admin,5["kill",{"uid":"x"}]"#);
    }

    #[test]
    fn test_connect_packets() {
        assert_eq!(SocketPacket::connect().encode(), "0");
        let packet = SocketPacket::decode(r#"0{"sid":"xyz"}"#).unwrap();
        match packet {
            SocketPacket::Connect { data, .. } => assert_eq!(data.unwrap()["sid"], "xyz"),
            other => panic!("unexpected packet: {:?}", other),
        }
        assert!(matches!(
            SocketPacket::decode("1").unwrap(),
            SocketPacket::Disconnect { .. }
        ));
    }

    #[test]
    fn test_binary_rejected() {
        assert!(matches!(
            SocketPacket::decode(r#"51-["x",{"_placeholder":true,"num":0}]"#),
            Err(PacketError::Binary)
        ));
    }

    #[test]
    fn test_event_requires_name() {
        assert!(SocketPacket::decode("2[1,2]").is_err());
        assert!(SocketPacket::decode(r#"2{"a":1}"#).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SocketPacket::decode("2[not json"),
            Err(PacketError::InvalidPayload(_))
        ));
    }
}
