//! Event and payload types exchanged with the MATL Online server.
//!
//! Socket events are carried by the codec in `packet.rs`; the HTTP payloads
//! are used by `api.rs`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SUBMIT_EVENT: &str = "submit";
pub const KILL_EVENT: &str = "kill";
pub const CONNECTION_EVENT: &str = "connection";
pub const STATUS_EVENT: &str = "status";
pub const COMPLETE_EVENT: &str = "complete";
pub const KILLED_EVENT: &str = "killed";

/// Kind of a streamed output fragment.
///
/// Anything the client does not recognise (the server also sends `stdout2`
/// for explicitly flushed output) is plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Stdout,
    Stderr,
    Image,
    /// Image to be scaled with nearest-neighbour interpolation.
    ImageNn,
    Audio,
    #[default]
    #[serde(other)]
    Text,
}

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type", default)]
    pub kind: StatusKind,
    /// Text content, or a media URL / data URI for image and audio kinds.
    #[serde(default)]
    pub value: String,
}

impl StatusMessage {
    pub fn new(kind: StatusKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Payload of a `status` event: the complete output of the current run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBatch {
    /// Session the batch belongs to. Batches without one never match.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub data: Vec<StatusMessage>,
}

/// Payload of a `submit` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub code: String,
    pub inputs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    pub version: String,
    pub uid: Option<String>,
}

/// Payload of a `kill` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillPayload {
    pub uid: Option<String>,
}

/// Optional payload of a `complete` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteInfo {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Submit(SubmitPayload),
    Kill(KillPayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Submit(_) => SUBMIT_EVENT,
            ClientEvent::Kill(_) => KILL_EVENT,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ClientEvent::Submit(payload) => serde_json::to_value(payload),
            ClientEvent::Kill(payload) => serde_json::to_value(payload),
        }
    }
}

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Session identifier handed out once per connection.
    Connection { session_id: String },
    Status(StatusBatch),
    Complete(CompleteInfo),
    Killed,
    /// Any event this client has no use for.
    Other { name: String },
}

#[derive(Deserialize)]
struct ConnectionPayload {
    session_id: String,
}

impl ServerEvent {
    /// Build a server event from a Socket.IO event name and its arguments.
    pub fn from_event(name: &str, args: &[Value]) -> Result<Self, serde_json::Error> {
        let payload = args.first().cloned().unwrap_or(Value::Null);

        match name {
            CONNECTION_EVENT => {
                let payload: ConnectionPayload = serde_json::from_value(payload)?;
                Ok(ServerEvent::Connection {
                    session_id: payload.session_id,
                })
            }
            STATUS_EVENT => Ok(ServerEvent::Status(serde_json::from_value(payload)?)),
            // No payload is required; anything unexpected reads as "no details".
            COMPLETE_EVENT => Ok(ServerEvent::Complete(
                serde_json::from_value(payload).unwrap_or_default(),
            )),
            KILLED_EVENT => Ok(ServerEvent::Killed),
            other => Ok(ServerEvent::Other {
                name: other.to_string(),
            }),
        }
    }
}

/// Response of `GET /explain`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplainResponse {
    #[serde(default)]
    pub data: Vec<StatusMessage>,
}

impl ExplainResponse {
    /// All fragments concatenated into one explanation.
    pub fn text(&self) -> String {
        self.data.iter().map(|m| m.value.as_str()).collect()
    }
}

/// One documented MATL function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpEntry {
    pub source: String,
    #[serde(default)]
    pub brief: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub arguments: String,
    #[serde(default)]
    pub description: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Response of `GET /help/{version}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelpResponse {
    #[serde(default)]
    pub data: Vec<HelpEntry>,
}

/// Response of `POST /share`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_kinds() {
        let batch: StatusBatch = serde_json::from_value(json!({
            "session": "abc",
            "data": [
                {"type": "stdout", "value": "1"},
                {"type": "stderr", "value": "oops"},
                {"type": "image_nn", "value": "data:image/png;base64,AAAA"},
                {"type": "stdout2", "value": "flushed"},
                {"value": "untyped"},
            ]
        }))
        .unwrap();

        let kinds: Vec<StatusKind> = batch.data.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StatusKind::Stdout,
                StatusKind::Stderr,
                StatusKind::ImageNn,
                StatusKind::Text,
                StatusKind::Text,
            ]
        );
        assert_eq!(batch.session.as_deref(), Some("abc"));
    }

    #[test]
    fn test_submit_payload_shape() {
        let payload = SubmitPayload {
            code: ":t!".into(),
            inputs: "120".into(),
            debug: None,
            version: "22.7.4".into(),
            uid: None,
        };
        let value = ClientEvent::Submit(payload).to_value().unwrap();
        assert_eq!(
            value,
            json!({"code": ":t!", "inputs": "120", "version": "22.7.4", "uid": null})
        );
    }

    #[test]
    fn test_kill_event_name() {
        let event = ClientEvent::Kill(KillPayload {
            uid: Some("abc".into()),
        });
        assert_eq!(event.name(), "kill");
        assert_eq!(event.to_value().unwrap(), json!({"uid": "abc"}));
    }

    #[test]
    fn test_server_events() {
        assert_eq!(
            ServerEvent::from_event("connection", &[json!({"session_id": "s1"})]).unwrap(),
            ServerEvent::Connection {
                session_id: "s1".into()
            }
        );
        assert_eq!(
            ServerEvent::from_event("complete", &[]).unwrap(),
            ServerEvent::Complete(CompleteInfo::default())
        );
        assert_eq!(
            ServerEvent::from_event(
                "complete",
                &[json!({"success": false, "message": "User terminated the job"})]
            )
            .unwrap(),
            ServerEvent::Complete(CompleteInfo {
                success: Some(false),
                message: Some("User terminated the job".into()),
            })
        );
        assert_eq!(
            ServerEvent::from_event("killed", &[]).unwrap(),
            ServerEvent::Killed
        );
        assert!(matches!(
            ServerEvent::from_event("whatever", &[]).unwrap(),
            ServerEvent::Other { .. }
        ));
        assert!(ServerEvent::from_event("connection", &[json!({})]).is_err());
    }

    #[test]
    fn test_explain_text() {
        let response: ExplainResponse = serde_json::from_value(json!({
            "data": [{"type": "stdout", "value": "a "}, {"type": "stdout", "value": "b"}]
        }))
        .unwrap();
        assert_eq!(response.text(), "a b");
    }

    #[test]
    fn test_help_entry_null_arguments() {
        let entry: HelpEntry = serde_json::from_value(json!({
            "source": "X+", "brief": "sum", "arguments": null, "description": "adds"
        }))
        .unwrap();
        assert_eq!(entry.arguments, "");
    }
}
