//! Voice Session State Machine
//!
//! `VoiceSession` owns every piece of mutable state of one voice conversation:
//! the connection state, the retry counter, the recording/processing/speaking
//! flags and the transcript. It performs no I/O. A runtime feeds it
//! [`SessionEvent`]s one at a time and executes the [`Command`]s it returns, in
//! order. All mutual exclusion between capture, network exchange and playback
//! is enforced here by checking the busy flags before each transition.

use crate::{
    Command, Notice, UserId,
    protocol::ServerMessage,
    transcript::{Role, Transcript},
};
use base64::Engine;
use std::{fmt, time::Duration};
use tracing::{debug, info, warn};

/// Timing and retry limits of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    /// Reconnects allowed after consecutive unexpected closes.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect.
    pub reconnect_delay: Duration,
    /// Recording is force-stopped after this long.
    pub inactivity_timeout: Duration,
    /// Pause between the end of an AI utterance and the next recording.
    pub resume_delay: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(10),
            resume_delay: Duration::from_secs(1),
        }
    }
}

/// Synthesizer settings applied during initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSettings {
    pub locale: String,
    pub rate: f32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            locale: "ko-KR".to_string(),
            rate: 0.5,
        }
    }
}

/// Result of the microphone permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, not yet initialized.
    Idle,
    Active,
    /// Ended by the user, by teardown, or by a refused permission.
    Ended,
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Initialize { microphone: Permission },
    ConnectionOpened,
    MessageReceived(String),
    ConnectionError(String),
    ConnectionClosed { code: Option<u16>, reason: String },
    ReconnectDue,
    StartRecording,
    StopRecording,
    /// The record button: stops an active recording, otherwise starts one
    /// when [`VoiceSession::can_record`] allows it.
    RecordButton,
    CaptureFailed(String),
    /// Answer to `Command::FinishCapture`: the WAV bytes, or why they could not be read.
    CaptureFinished(Result<Vec<u8>, String>),
    InactivityElapsed { token: u64 },
    /// Progress of the utterance started by `Command::Speak { token, .. }`.
    SpeechStarted { token: u64 },
    SpeechFinished { token: u64 },
    SpeechCancelled { token: u64 },
    SpeechFailed { token: u64, error: String },
    ResumeDue,
    EndConversation,
    Teardown,
}

/// What the conversation screen shows as its status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Speaking,
    Processing,
    Recording,
    Connecting,
    Idle,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Speaking => "AI 말하는 중...",
            SessionStatus::Processing => "음성 처리 중...",
            SessionStatus::Recording => "녹음 중...",
            SessionStatus::Connecting => "연결 중...",
            SessionStatus::Idle => "대기 중",
        };
        f.write_str(label)
    }
}

pub struct VoiceSession {
    user_id: UserId,
    url: String,
    speech: SpeechSettings,
    policy: SessionPolicy,
    phase: Phase,
    connection: ConnectionState,
    retry_count: u32,
    reconnect_pending: bool,
    user_closed: bool,
    is_recording: bool,
    is_processing: bool,
    is_speaking: bool,
    awaiting_capture: bool,
    timer_token: u64,
    speech_token: u64,
    transcript: Transcript,
}

impl VoiceSession {
    /// Creates a session for `user_id` talking to the server at `host` (`host[:port]`).
    pub fn new(user_id: UserId, host: &str, speech: SpeechSettings, policy: SessionPolicy) -> Self {
        let url = user_id.endpoint(host);
        Self {
            user_id,
            url,
            speech,
            policy,
            phase: Phase::Idle,
            connection: ConnectionState::Disconnected,
            retry_count: 0,
            reconnect_pending: false,
            user_closed: false,
            is_recording: false,
            is_processing: false,
            is_speaking: false,
            awaiting_capture: false,
            timer_token: 0,
            speech_token: 0,
            transcript: Transcript::new(),
        }
    }

    /// Applies one event and returns the side effects to perform, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Command> {
        match self.phase {
            Phase::Idle => self.handle_idle(event),
            Phase::Active => self.handle_active(event),
            Phase::Ended => self.handle_ended(event),
        }
    }

    fn handle_idle(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::Initialize {
                microphone: Permission::Denied,
            } => {
                warn!("Microphone permission denied; aborting initialization.");
                self.phase = Phase::Ended;
                vec![Command::Notify(Notice::PermissionRequired)]
            }
            SessionEvent::Initialize {
                microphone: Permission::Granted,
            } => {
                info!(user_id = %self.user_id, "Initializing voice session.");
                self.phase = Phase::Active;
                self.user_closed = false;
                let mut commands = vec![Command::ConfigureSpeech {
                    locale: self.speech.locale.clone(),
                    rate: self.speech.rate,
                }];
                commands.extend(self.connect());
                commands
            }
            SessionEvent::Teardown => self.release(),
            other => {
                debug!(event = ?other, "Ignoring event before initialization.");
                vec![]
            }
        }
    }

    fn handle_ended(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::ConnectionClosed { code, .. } => {
                debug!(?code, "Connection closed after session end.");
                self.connection = ConnectionState::Disconnected;
                vec![]
            }
            SessionEvent::ConnectionError(_) => {
                self.connection = ConnectionState::Disconnected;
                vec![]
            }
            SessionEvent::SpeechStarted { .. }
            | SessionEvent::SpeechFinished { .. }
            | SessionEvent::SpeechCancelled { .. }
            | SessionEvent::SpeechFailed { .. } => {
                self.is_speaking = false;
                vec![]
            }
            SessionEvent::Teardown => self.release(),
            other => {
                debug!(event = ?other, "Ignoring event after session end.");
                vec![]
            }
        }
    }

    fn handle_active(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::Initialize { .. } => {
                warn!("Session is already initialized.");
                vec![]
            }
            SessionEvent::ConnectionOpened => {
                info!("Conversation socket connected.");
                self.connection = ConnectionState::Connected;
                self.retry_count = 0;
                vec![]
            }
            SessionEvent::MessageReceived(text) => self.on_message(&text),
            SessionEvent::ConnectionError(error) => {
                warn!(%error, "Conversation socket error.");
                self.connection = ConnectionState::Disconnected;
                vec![]
            }
            SessionEvent::ConnectionClosed { code, reason } => self.on_closed(code, &reason),
            SessionEvent::ReconnectDue => {
                if self.user_closed || !self.reconnect_pending {
                    return vec![];
                }
                self.reconnect_pending = false;
                self.connect()
            }
            SessionEvent::StartRecording => self.start_recording(),
            SessionEvent::StopRecording => self.stop_recording(),
            SessionEvent::RecordButton => {
                if self.is_recording {
                    self.stop_recording()
                } else if self.can_record() {
                    self.start_recording()
                } else {
                    debug!(status = %self.status(), "Record button is disabled.");
                    vec![]
                }
            }
            SessionEvent::CaptureFailed(error) => {
                warn!(%error, "Audio capture failed to start.");
                if !self.is_recording {
                    return vec![];
                }
                self.is_recording = false;
                vec![
                    Command::CancelInactivityTimer,
                    Command::Notify(Notice::RecordingStartFailed),
                ]
            }
            SessionEvent::CaptureFinished(result) => self.on_capture_finished(result),
            SessionEvent::InactivityElapsed { token } => {
                if !self.is_recording || token != self.timer_token {
                    debug!(token, "Ignoring stale inactivity timer.");
                    return vec![];
                }
                info!("No speech within the inactivity window; stopping recording.");
                let mut commands = self.stop_recording();
                commands.push(Command::Notify(Notice::SilenceTimeout));
                commands
            }
            SessionEvent::SpeechStarted { token } => {
                if self.is_current_utterance(token) {
                    self.is_speaking = true;
                }
                vec![]
            }
            SessionEvent::SpeechFinished { token } => {
                if !self.is_current_utterance(token) {
                    return vec![];
                }
                self.is_speaking = false;
                vec![Command::ScheduleResume {
                    after: self.policy.resume_delay,
                }]
            }
            SessionEvent::SpeechCancelled { token } => {
                if self.is_current_utterance(token) {
                    self.is_speaking = false;
                }
                vec![]
            }
            SessionEvent::SpeechFailed { token, error } => {
                warn!(token, %error, "Speech synthesis failed.");
                if !self.is_current_utterance(token) {
                    return vec![];
                }
                self.is_speaking = false;
                vec![Command::Notify(Notice::SpeechFailed)]
            }
            SessionEvent::ResumeDue => {
                if self.is_recording || self.is_processing {
                    return vec![];
                }
                self.start_recording()
            }
            SessionEvent::EndConversation | SessionEvent::Teardown => {
                info!("Ending voice conversation.");
                self.release()
            }
        }
    }

    fn connect(&mut self) -> Vec<Command> {
        if self.connection != ConnectionState::Disconnected {
            debug!(state = ?self.connection, "Previous connection not closed; not connecting.");
            return vec![];
        }
        info!(url = %self.url, "Opening conversation socket.");
        self.connection = ConnectionState::Connecting;
        vec![Command::OpenConnection {
            url: self.url.clone(),
        }]
    }

    fn on_closed(&mut self, code: Option<u16>, reason: &str) -> Vec<Command> {
        info!(?code, reason, "Conversation socket closed.");
        self.connection = ConnectionState::Disconnected;
        // A reply can only arrive on the socket that received the capture.
        self.is_processing = false;
        self.awaiting_capture = false;

        if self.user_closed {
            return vec![];
        }
        if self.retry_count < self.policy.max_reconnect_attempts {
            self.retry_count += 1;
            self.reconnect_pending = true;
            info!(
                attempt = self.retry_count,
                max = self.policy.max_reconnect_attempts,
                "Scheduling reconnect."
            );
            vec![Command::ScheduleReconnect {
                attempt: self.retry_count,
                after: self.policy.reconnect_delay,
            }]
        } else {
            warn!("Reconnect attempts exhausted.");
            vec![Command::Notify(Notice::ConnectionFailed)]
        }
    }

    fn on_message(&mut self, text: &str) -> Vec<Command> {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::AiMessage { content }) => {
                let turn = self.transcript.push(Role::Ai, content.clone());
                self.is_processing = false;
                // Speaking from the moment playback is requested; a newer
                // utterance supersedes any still playing.
                self.speech_token += 1;
                self.is_speaking = true;
                vec![
                    Command::ShowTurn(turn),
                    Command::Speak {
                        token: self.speech_token,
                        text: content,
                    },
                ]
            }
            Ok(ServerMessage::UserMessage { content }) => {
                let turn = self.transcript.push(Role::User, content);
                vec![Command::ShowTurn(turn)]
            }
            Ok(ServerMessage::Error { content }) => {
                warn!(%content, "Server reported a processing error.");
                self.is_processing = false;
                vec![Command::Notify(Notice::ServerError(content))]
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed server message.");
                self.is_processing = false;
                vec![]
            }
        }
    }

    fn is_current_utterance(&self, token: u64) -> bool {
        let current = token == self.speech_token;
        if !current {
            debug!(token, current = self.speech_token, "Ignoring event for a superseded utterance.");
        }
        current
    }

    fn start_recording(&mut self) -> Vec<Command> {
        if self.is_recording || self.is_speaking || self.is_processing {
            debug!(status = %self.status(), "Recording not started.");
            return vec![];
        }
        self.is_recording = true;
        self.timer_token += 1;
        vec![
            Command::StartCapture,
            Command::ArmInactivityTimer {
                token: self.timer_token,
                after: self.policy.inactivity_timeout,
            },
        ]
    }

    fn stop_recording(&mut self) -> Vec<Command> {
        if !self.is_recording {
            return vec![];
        }
        self.is_recording = false;
        self.is_processing = true;
        self.awaiting_capture = true;
        vec![Command::CancelInactivityTimer, Command::FinishCapture]
    }

    fn on_capture_finished(&mut self, result: Result<Vec<u8>, String>) -> Vec<Command> {
        if !self.awaiting_capture {
            debug!("Ignoring capture that is no longer awaited.");
            return vec![];
        }
        self.awaiting_capture = false;
        match result {
            Ok(wav) if self.connection == ConnectionState::Connected => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&wav);
                debug!(bytes = wav.len(), "Sending captured audio.");
                vec![Command::SendAudio(encoded)]
            }
            Ok(_) => {
                warn!(state = ?self.connection, "Socket not open; discarding capture.");
                self.is_processing = false;
                vec![]
            }
            Err(error) => {
                warn!(%error, "Failed to read captured audio.");
                self.is_processing = false;
                vec![Command::Notify(Notice::RecordingProcessingFailed)]
            }
        }
    }

    /// Releases capture and playback, then closes the socket without reconnecting.
    fn release(&mut self) -> Vec<Command> {
        self.phase = Phase::Ended;
        self.user_closed = true;
        self.reconnect_pending = false;
        self.is_recording = false;
        self.is_processing = false;
        self.is_speaking = false;
        self.awaiting_capture = false;

        let mut commands = vec![
            Command::CancelInactivityTimer,
            Command::AbortCapture,
            Command::StopSpeech,
        ];
        if matches!(
            self.connection,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.connection = ConnectionState::Closing;
            commands.push(Command::CloseConnection);
        }
        commands.push(Command::Exit);
        commands
    }

    /// Whether the record button is enabled.
    pub fn can_record(&self) -> bool {
        self.phase == Phase::Active
            && self.connection == ConnectionState::Connected
            && !self.is_speaking
            && !self.is_processing
    }

    pub fn status(&self) -> SessionStatus {
        if self.is_speaking {
            SessionStatus::Speaking
        } else if self.is_processing {
            SessionStatus::Processing
        } else if self.is_recording {
            SessionStatus::Recording
        } else if self.connection != ConnectionState::Connected {
            SessionStatus::Connecting
        } else {
            SessionStatus::Idle
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}
