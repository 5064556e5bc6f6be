//! Defines the WebSocket message protocol between the senior app and the conversation server.
//!
//! Outbound frames are not JSON: a finished capture is sent as the bare base64
//! string of its WAV bytes. Inbound frames are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

/// Messages sent from the server to the client.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The AI's reply, to be shown and spoken.
    AiMessage { content: String },
    /// Echo of what the server transcribed from the user's capture.
    UserMessage { content: String },
    /// The server failed to process the last turn.
    Error { content: String },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, crate::VoiceError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VoiceError;

    #[test]
    fn test_parse_ai_message() {
        let msg = ServerMessage::parse(r#"{"type":"ai_message","content":"안녕하세요"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::AiMessage {
                content: "안녕하세요".to_string()
            }
        );
    }

    #[test]
    fn test_parse_user_and_error_messages() {
        let user = ServerMessage::parse(r#"{"type":"user_message","content":"hi"}"#).unwrap();
        assert!(matches!(user, ServerMessage::UserMessage { content } if content == "hi"));

        let err = ServerMessage::parse(r#"{"type":"error","content":"STT failed"}"#).unwrap();
        assert!(matches!(err, ServerMessage::Error { content } if content == "STT failed"));
    }

    #[test]
    fn test_parse_rejects_unknown_type_and_garbage() {
        let unknown = ServerMessage::parse(r#"{"type":"status","content":"x"}"#);
        assert!(matches!(unknown, Err(VoiceError::MalformedMessage(_))));

        let missing_content = ServerMessage::parse(r#"{"type":"ai_message"}"#);
        assert!(missing_content.is_err());

        assert!(ServerMessage::parse("UklGRiQAAABXQVZF").is_err());
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let msg =
            ServerMessage::parse(r#"{"type":"ai_message","content":"ok","audio":null}"#).unwrap();
        assert!(matches!(msg, ServerMessage::AiMessage { .. }));
    }
}
