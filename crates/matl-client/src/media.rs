//! `data:` URIs carried by image and audio output.

use base64::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("not a data URI")]
    NotDataUri,

    #[error("data URI is not base64-encoded")]
    NotBase64,

    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// A decoded `data:<mime>;base64,<payload>` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl DataUri {
    pub fn parse(value: &str) -> Result<Self, MediaError> {
        let rest = value.strip_prefix("data:").ok_or(MediaError::NotDataUri)?;
        let (header, payload) = rest.split_once(',').ok_or(MediaError::NotDataUri)?;

        let mut params = header.split(';');
        let mime = params.next().unwrap_or_default();
        if !params.any(|param| param.eq_ignore_ascii_case("base64")) {
            return Err(MediaError::NotBase64);
        }

        let payload: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self {
            mime: if mime.is_empty() {
                "text/plain".to_string()
            } else {
                mime.to_ascii_lowercase()
            },
            bytes: BASE64_STANDARD.decode(payload)?,
        })
    }

    /// File extension for the MIME type.
    pub fn extension(&self) -> &str {
        match self.mime.as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/svg+xml" => "svg",
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/mpeg" => "mp3",
            "audio/ogg" => "ogg",
            _ => "bin",
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }

    /// Encode back into a data URI.
    pub fn to_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64_STANDARD.encode(&self.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_png() {
        let uri = DataUri::parse("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(uri.mime, "image/png");
        assert_eq!(&uri.bytes[1..4], b"PNG");
        assert_eq!(uri.extension(), "png");
        assert!(uri.is_image());
    }

    #[test]
    fn test_parse_wav() {
        let uri = DataUri::parse("data:audio/wav;base64,UklGRg==").unwrap();
        assert_eq!(uri.bytes, b"RIFF");
        assert_eq!(uri.extension(), "wav");
        assert!(!uri.is_image());
    }

    #[test]
    fn test_rejects_plain_urls_and_non_base64() {
        assert!(matches!(
            DataUri::parse("https://example.net/x.png"),
            Err(MediaError::NotDataUri)
        ));
        assert!(matches!(
            DataUri::parse("data:text/plain,hello"),
            Err(MediaError::NotBase64)
        ));
        assert!(matches!(
            DataUri::parse("data:image/png;base64,***"),
            Err(MediaError::Decode(_))
        ));
    }

    #[test]
    fn test_to_uri() {
        let uri = DataUri {
            mime: "image/png".into(),
            bytes: b"abc".to_vec(),
        };
        assert_eq!(uri.to_uri(), "data:image/png;base64,YWJj");
        assert_eq!(DataUri::parse(&uri.to_uri()).unwrap(), uri);
    }
}
