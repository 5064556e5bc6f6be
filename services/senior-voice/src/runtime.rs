//! Voice Session Runtime
//!
//! Drives a [`VoiceSession`] against real devices. Every collaborator (socket,
//! recorder, synthesizer, timers, the user) reports back by posting a
//! [`SessionEvent`] on one channel; the runtime feeds those events to the
//! session strictly one at a time and executes the returned commands in order.

use crate::{
    capture::{AudioRecorder, CaptureWorker, MicrophoneAccess},
    speech::SpeechSynthesizer,
    transport::Connection,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, instrument, warn};
use tripot_core::{
    Command, Notice, Permission, SessionEvent, SessionStatus, SpeechSettings, Turn, VoiceError,
    VoiceSession,
};

/// Where collaborators post their events.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

// How long shutdown waits for the close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// What the conversation screen needs to render.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeUpdate {
    Turn(Turn),
    Notice(Notice),
    Status(SessionStatus),
}

/// User-facing controls of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: EventSink,
}

impl SessionHandle {
    pub fn start_recording(&self) -> bool {
        self.post(SessionEvent::StartRecording)
    }

    pub fn stop_recording(&self) -> bool {
        self.post(SessionEvent::StopRecording)
    }

    /// Toggles recording.
    pub fn record_button(&self) -> bool {
        self.post(SessionEvent::RecordButton)
    }

    pub fn end_conversation(&self) -> bool {
        self.post(SessionEvent::EndConversation)
    }

    /// Releases everything, as when the screen goes away.
    pub fn teardown(&self) -> bool {
        self.post(SessionEvent::Teardown)
    }

    /// Returns `false` once the runtime has stopped.
    fn post(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// The platform capabilities a session runs on.
pub struct Devices {
    pub recorder: Box<dyn AudioRecorder>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub microphone: Arc<dyn MicrophoneAccess>,
}

pub struct VoiceRuntime {
    session: VoiceSession,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    microphone: Arc<dyn MicrophoneAccess>,
    // Moved into `capture` once the loop is running.
    recorder: Option<Box<dyn AudioRecorder>>,
    capture: Option<CaptureWorker>,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    updates: mpsc::UnboundedSender<RuntimeUpdate>,
    connection: Option<Connection>,
    inactivity_timer: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    last_status: Option<SessionStatus>,
}

impl VoiceRuntime {
    pub fn new(
        session: VoiceSession,
        devices: Devices,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<RuntimeUpdate>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            events: events_tx.clone(),
        };
        let Devices {
            recorder,
            synthesizer,
            microphone,
        } = devices;
        let runtime = Self {
            session,
            synthesizer,
            microphone,
            recorder: Some(recorder),
            capture: None,
            events_tx,
            events_rx,
            updates,
            connection: None,
            inactivity_timer: None,
            timers: Vec::new(),
            last_status: None,
        };
        (runtime, handle, updates_rx)
    }

    /// Runs the conversation until it ends.
    ///
    /// Returns `Err(VoiceError::PermissionDenied)` without connecting when the
    /// microphone is refused.
    #[instrument(name = "voice_session", skip_all, fields(user_id = %self.session.user_id()))]
    pub async fn run(mut self) -> Result<(), VoiceError> {
        let permission = self.microphone.request().await;
        info!(?permission, "Microphone permission resolved.");
        if let Some(recorder) = self.recorder.take() {
            self.capture = Some(CaptureWorker::spawn(recorder, self.events_tx.clone()));
        }

        let mut exited = self
            .dispatch(SessionEvent::Initialize {
                microphone: permission,
            })
            .await;
        if permission == Permission::Denied {
            self.shutdown().await;
            return Err(VoiceError::PermissionDenied);
        }

        while !exited {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            exited = self.dispatch(event).await;
        }

        self.shutdown().await;
        info!("Voice session finished.");
        Ok(())
    }

    /// Feeds one event to the session. Returns `true` when the session exited.
    async fn dispatch(&mut self, event: SessionEvent) -> bool {
        debug!(?event, "Dispatching session event.");
        let commands = self.session.handle(event);
        let mut exited = false;
        for command in commands {
            if self.execute(command).await {
                exited = true;
            }
        }
        self.publish_status();
        exited
    }

    async fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::ConfigureSpeech { locale, rate } => {
                let settings = SpeechSettings { locale, rate };
                if let Err(e) = self.synthesizer.configure(settings).await {
                    warn!(error = %e, "Failed to configure speech; using synthesizer defaults.");
                }
            }
            Command::OpenConnection { url } => {
                info!(%url, "Opening conversation socket.");
                self.connection = Some(Connection::open(url, self.events_tx.clone()));
            }
            Command::CloseConnection => {
                if let Some(connection) = &self.connection {
                    connection.close();
                }
            }
            Command::SendAudio(encoded) => match &self.connection {
                Some(connection) => {
                    if let Err(e) = connection.send_text(encoded) {
                        warn!(error = %e, "Dropping recording.");
                    }
                }
                None => warn!("No socket for recording; dropping it."),
            },
            Command::StartCapture => self.with_capture(CaptureWorker::start),
            Command::FinishCapture => self.with_capture(CaptureWorker::finish),
            Command::AbortCapture => self.with_capture(CaptureWorker::abort),
            Command::ArmInactivityTimer { token, after } => {
                self.cancel_inactivity_timer();
                self.inactivity_timer = Some(self.spawn_timer(
                    after,
                    SessionEvent::InactivityElapsed { token },
                ));
            }
            Command::CancelInactivityTimer => self.cancel_inactivity_timer(),
            Command::Speak { token, text } => {
                self.synthesizer.speak(token, text, self.events_tx.clone());
            }
            Command::StopSpeech => self.synthesizer.stop(),
            Command::ScheduleReconnect { attempt, after } => {
                info!(attempt, delay_ms = after.as_millis() as u64, "Scheduling reconnect.");
                let timer = self.spawn_timer(after, SessionEvent::ReconnectDue);
                self.track(timer);
            }
            Command::ScheduleResume { after } => {
                let timer = self.spawn_timer(after, SessionEvent::ResumeDue);
                self.track(timer);
            }
            Command::ShowTurn(turn) => {
                debug!(id = turn.id, role = %turn.role, "New turn.");
                self.publish(RuntimeUpdate::Turn(turn));
            }
            Command::Notify(notice) => {
                warn!(%notice, "Notifying user.");
                self.publish(RuntimeUpdate::Notice(notice));
            }
            Command::Exit => return true,
        }
        false
    }

    fn with_capture(&self, request: impl FnOnce(&CaptureWorker)) {
        match &self.capture {
            Some(capture) => request(capture),
            None => warn!("Capture worker is not running."),
        }
    }

    fn publish(&self, update: RuntimeUpdate) {
        if self.updates.send(update).is_err() {
            debug!("No one is listening for updates.");
        }
    }

    fn publish_status(&mut self) {
        let status = self.session.status();
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            self.publish(RuntimeUpdate::Status(status));
        }
    }

    fn spawn_timer(&self, after: Duration, event: SessionEvent) -> JoinHandle<()> {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        })
    }

    fn track(&mut self, timer: JoinHandle<()>) {
        self.timers.retain(|t| !t.is_finished());
        self.timers.push(timer);
    }

    fn cancel_inactivity_timer(&mut self) {
        if let Some(timer) = self.inactivity_timer.take() {
            timer.abort();
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_inactivity_timer();
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.shutdown(CLOSE_GRACE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::MockSpeechSynthesizer;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tripot_core::{SessionPolicy, UserId};

    struct NoRecorder;

    impl AudioRecorder for NoRecorder {
        fn start(&mut self) -> Result<(), VoiceError> {
            Err(VoiceError::Device("no microphone".to_string()))
        }
        fn finish(&mut self) -> Result<Vec<u8>, VoiceError> {
            Err(VoiceError::Device("no microphone".to_string()))
        }
        fn abort(&mut self) {}
    }

    struct FixedMicrophone(Permission);

    #[async_trait]
    impl MicrophoneAccess for FixedMicrophone {
        async fn request(&self) -> Permission {
            self.0
        }
    }

    fn session(host: &str, policy: SessionPolicy) -> VoiceSession {
        VoiceSession::new(
            UserId::from("user_test".to_string()),
            host,
            SpeechSettings::default(),
            policy,
        )
    }

    #[tokio::test]
    async fn test_denied_permission_never_configures_speech() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer.expect_configure().times(0);
        synthesizer.expect_speak().times(0);
        synthesizer.expect_stop().returning(|| ());

        let devices = Devices {
            recorder: Box::new(NoRecorder),
            synthesizer: Arc::new(synthesizer),
            microphone: Arc::new(FixedMicrophone(Permission::Denied)),
        };
        let (runtime, _handle, mut updates) =
            VoiceRuntime::new(session("127.0.0.1:9", SessionPolicy::default()), devices);

        let result = runtime.run().await;
        assert!(matches!(result, Err(VoiceError::PermissionDenied)));

        let mut notices = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let RuntimeUpdate::Notice(notice) = update {
                notices.push(notice);
            }
        }
        assert_eq!(notices, vec![Notice::PermissionRequired]);
    }

    #[tokio::test]
    async fn test_unreachable_server_without_retries_notifies_then_ends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer
            .expect_configure()
            .withf(|settings| settings.locale == "ko-KR" && settings.rate == 0.5)
            .times(1)
            .returning(|_| Ok(()));
        synthesizer.expect_stop().returning(|| ());

        let devices = Devices {
            recorder: Box::new(NoRecorder),
            synthesizer: Arc::new(synthesizer),
            microphone: Arc::new(FixedMicrophone(Permission::Granted)),
        };
        let policy = SessionPolicy {
            max_reconnect_attempts: 0,
            ..SessionPolicy::default()
        };
        let (runtime, handle, mut updates) = VoiceRuntime::new(session(&addr.to_string(), policy), devices);
        let run = tokio::spawn(runtime.run());

        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = updates.recv().await {
                if let RuntimeUpdate::Notice(notice) = update {
                    return Some(notice);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(notice, Some(Notice::ConnectionFailed));

        assert!(handle.end_conversation());
        run.await.unwrap().unwrap();
        assert!(!handle.record_button());
    }

    #[tokio::test]
    async fn test_failed_capture_start_is_reported() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer.expect_configure().returning(|_| Ok(()));
        synthesizer.expect_stop().returning(|| ());

        let devices = Devices {
            recorder: Box::new(NoRecorder),
            synthesizer: Arc::new(synthesizer),
            microphone: Arc::new(FixedMicrophone(Permission::Granted)),
        };
        // Explicit starts are not gated on the socket.
        let (runtime, handle, mut updates) =
            VoiceRuntime::new(session("127.0.0.1:9", SessionPolicy::default()), devices);
        let run = tokio::spawn(runtime.run());

        handle.start_recording();
        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = updates.recv().await {
                if let RuntimeUpdate::Notice(notice @ Notice::RecordingStartFailed) = update {
                    return Some(notice);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(notice, Some(Notice::RecordingStartFailed));

        handle.teardown();
        run.await.unwrap().unwrap();
    }

    /// Holds `start` until the test releases it.
    struct GatedRecorder {
        gate: std::sync::mpsc::Receiver<()>,
    }

    impl AudioRecorder for GatedRecorder {
        fn start(&mut self) -> Result<(), VoiceError> {
            let _ = self.gate.recv();
            Ok(())
        }
        fn finish(&mut self) -> Result<Vec<u8>, VoiceError> {
            Ok(Vec::new())
        }
        fn abort(&mut self) {}
    }

    #[tokio::test]
    async fn test_slow_capture_start_does_not_stall_event_loop() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer.expect_configure().returning(|_| Ok(()));
        synthesizer.expect_stop().returning(|| ());

        let (release, gate) = std::sync::mpsc::channel();
        let devices = Devices {
            recorder: Box::new(GatedRecorder { gate }),
            synthesizer: Arc::new(synthesizer),
            microphone: Arc::new(FixedMicrophone(Permission::Granted)),
        };
        let (runtime, handle, mut updates) =
            VoiceRuntime::new(session("127.0.0.1:9", SessionPolicy::default()), devices);
        let run = tokio::spawn(runtime.run());

        // The device is still opening; the loop must keep publishing updates.
        handle.start_recording();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = updates.recv().await {
                if update == RuntimeUpdate::Status(SessionStatus::Recording) {
                    return Some(update);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(status, Some(RuntimeUpdate::Status(SessionStatus::Recording)));

        release.send(()).unwrap();
        handle.teardown();
        run.await.unwrap().unwrap();
    }
}
