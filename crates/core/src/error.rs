/// Failure categories of a voice conversation.
///
/// None of these are fatal to the process. Each is handled where it occurs and
/// turned into a [`crate::Notice`] or a log line; only `PermissionDenied` ends
/// the session it belongs to.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("Connection failure: {0}")]
    Connection(String),
    #[error("Malformed server message: {0}")]
    MalformedMessage(#[from] serde_json::Error),
    #[error("Audio device failure: {0}")]
    Device(String),
}
