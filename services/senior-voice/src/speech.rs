//! Text-to-speech playback.
//!
//! Synthesizers report progress by posting `SpeechStarted`, `SpeechFinished`,
//! `SpeechCancelled` or `SpeechFailed` to the session's event sink, tagged with
//! the token of the utterance they belong to.

use crate::runtime::EventSink;
use async_trait::async_trait;
use std::{
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{process::Command, sync::oneshot};
use tracing::{debug, info, warn};
use tripot_core::{SessionEvent, SpeechSettings, VoiceError};

// espeak-ng's default speed, used for a rate of 0.5.
const NORMAL_WORDS_PER_MINUTE: f32 = 175.0;

/// Speaks one utterance at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Applies locale and rate for later utterances.
    async fn configure(&self, settings: SpeechSettings) -> Result<(), VoiceError>;
    /// Starts speaking `text` and returns immediately. Any utterance still
    /// playing is cancelled first and reports under its own token.
    fn speak(&self, token: u64, text: String, events: EventSink);
    /// Cancels the current utterance, if any.
    fn stop(&self);
}

/// Speaks through an espeak-compatible command line program.
pub struct EspeakSynthesizer {
    program: String,
    settings: Mutex<SpeechSettings>,
    current: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl EspeakSynthesizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            settings: Mutex::new(SpeechSettings::default()),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Command line arguments for `settings`, without the text itself.
    pub fn args(settings: &SpeechSettings) -> Vec<String> {
        vec![
            "-v".to_string(),
            voice_for_locale(&settings.locale),
            "-s".to_string(),
            words_per_minute(settings.rate).to_string(),
        ]
    }

    fn cancel_current(&self) {
        if let Some(cancel) = self.current.lock().ok().and_then(|mut c| c.take()) {
            let _ = cancel.send(());
        }
    }
}

/// `ko-KR` → `ko`.
fn voice_for_locale(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or(locale)
        .to_lowercase()
}

/// Maps the 0..=1 rate scale, where 0.5 is normal speed, to words per minute.
fn words_per_minute(rate: f32) -> u32 {
    (rate * 2.0 * NORMAL_WORDS_PER_MINUTE).round().max(80.0) as u32
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    async fn configure(&self, settings: SpeechSettings) -> Result<(), VoiceError> {
        info!(
            program = %self.program,
            locale = %settings.locale,
            rate = settings.rate,
            "Configuring speech synthesizer."
        );
        let mut current = self
            .settings
            .lock()
            .map_err(|_| VoiceError::Device("Speech settings poisoned".to_string()))?;
        *current = settings;
        Ok(())
    }

    fn speak(&self, token: u64, text: String, events: EventSink) {
        self.cancel_current();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(cancel_tx);
        }

        let args = match self.settings.lock() {
            Ok(settings) => Self::args(&settings),
            Err(_) => Self::args(&SpeechSettings::default()),
        };
        let program = self.program.clone();

        tokio::spawn(async move {
            let spawned = Command::new(&program)
                .args(&args)
                .arg(&text)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    warn!(%program, error = %e, "Failed to launch speech synthesizer.");
                    let _ = events.send(SessionEvent::SpeechFailed {
                        token,
                        error: e.to_string(),
                    });
                    return;
                }
            };
            let _ = events.send(SessionEvent::SpeechStarted { token });
            debug!(token, chars = text.chars().count(), "Speaking.");

            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => SessionEvent::SpeechFinished { token },
                    Ok(status) => SessionEvent::SpeechFailed {
                        token,
                        error: format!("{} exited with {}", program, status),
                    },
                    Err(e) => SessionEvent::SpeechFailed { token, error: e.to_string() },
                },
                _ = cancel_rx => {
                    let _ = child.kill().await;
                    SessionEvent::SpeechCancelled { token }
                }
            };
            let _ = events.send(outcome);
        });
    }

    fn stop(&self) {
        self.cancel_current();
    }
}
