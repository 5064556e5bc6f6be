//! Senior Voice Conversation Client
//!
//! This library runs the hands-free voice conversation between an elderly user
//! and the Tripot companion server: microphone capture, the conversation
//! socket, speech playback and local persistence. All conversation decisions
//! are made by [`tripot_core::VoiceSession`]; the modules here only carry them
//! out. The `senior-voice` binary is a thin terminal front end over it.

pub mod audio;
pub mod capture;
pub mod config;
pub mod runtime;
pub mod speech;
pub mod store;
pub mod transport;

pub use runtime::{Devices, RuntimeUpdate, SessionHandle, VoiceRuntime};
