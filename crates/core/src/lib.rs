pub mod error;
pub mod identity;
pub mod notice;
pub mod protocol;
pub mod session;
pub mod transcript;

pub use error::VoiceError;
pub use identity::UserId;
pub use notice::Notice;
pub use session::{
    Permission, SessionEvent, SessionPolicy, SessionStatus, SpeechSettings, VoiceSession,
};
pub use transcript::{Role, Transcript, Turn};

use std::time::Duration;

/// Represents commands that the session state machine issues to an external runtime.
///
/// This enum is the primary API for decoupling the session's decision-making
/// from the runtime's execution of side effects (opening sockets, driving the
/// microphone, speaking text, arming timers). Commands must be executed in the
/// order they are returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Apply synthesizer settings before the first utterance.
    ConfigureSpeech { locale: String, rate: f32 },
    /// Open the conversation socket at the given URL.
    OpenConnection { url: String },
    /// Close the live socket. The runtime reports the close back as an event.
    CloseConnection,
    /// Send a base64 encoded WAV capture as a raw text frame.
    SendAudio(String),
    /// Begin microphone capture.
    StartCapture,
    /// Stop microphone capture and hand the recorded WAV back to the session.
    FinishCapture,
    /// Stop microphone capture and throw the audio away.
    AbortCapture,
    /// Fire `SessionEvent::InactivityElapsed { token }` after `after`.
    ArmInactivityTimer { token: u64, after: Duration },
    CancelInactivityTimer,
    /// Speak `text`, cancelling any utterance still playing. Progress events
    /// carry the same `token`.
    Speak { token: u64, text: String },
    StopSpeech,
    /// Fire `SessionEvent::ReconnectDue` after `after`.
    ScheduleReconnect { attempt: u32, after: Duration },
    /// Fire `SessionEvent::ResumeDue` after `after`.
    ScheduleResume { after: Duration },
    /// A turn was appended to the transcript and should be rendered.
    ShowTurn(Turn),
    /// Surface a notice to the user.
    Notify(Notice),
    /// The conversation is over; control returns to the caller.
    Exit,
}
