//! Microphone access and capture.
//!
//! A cpal input stream is not `Send` on every platform, so each capture runs on
//! its own OS thread that owns the stream from open to drop. The recorder talks
//! to that thread over std channels.
//!
//! Opening a device and encoding a finished recording both block, so the
//! runtime drives its recorder through a [`CaptureWorker`] on tokio's blocking
//! pool and learns the outcome from posted events.

use crate::{audio, runtime::EventSink};
use async_trait::async_trait;
use cpal::{
    SampleFormat,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
};
use tokio::{sync::mpsc as job_channel, task::JoinHandle};
use tracing::{debug, error, info, warn};
use tripot_core::{Permission, SessionEvent, VoiceError};

/// Exclusive access to one microphone capture at a time.
pub trait AudioRecorder: Send {
    /// Starts capturing. Fails if the device cannot be opened.
    fn start(&mut self) -> Result<(), VoiceError>;
    /// Stops capturing and returns the recording as 16 kHz mono 16-bit WAV.
    fn finish(&mut self) -> Result<Vec<u8>, VoiceError>;
    /// Stops capturing and discards the recording. No-op when idle.
    fn abort(&mut self);
}

/// Answers whether the app may use the microphone.
#[async_trait]
pub trait MicrophoneAccess: Send + Sync {
    async fn request(&self) -> Permission;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureJob {
    Start,
    Finish,
    Abort,
}

/// Runs an [`AudioRecorder`] off the async executor, one request at a time and
/// in the order requested.
///
/// A failed start is posted as `SessionEvent::CaptureFailed` and every finish
/// as `SessionEvent::CaptureFinished`.
pub struct CaptureWorker {
    jobs: Option<job_channel::UnboundedSender<CaptureJob>>,
    task: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut recorder: Box<dyn AudioRecorder>, events: EventSink) -> Self {
        let (jobs, mut job_rx) = job_channel::unbounded_channel();
        let task = tokio::task::spawn_blocking(move || {
            while let Some(job) = job_rx.blocking_recv() {
                match job {
                    CaptureJob::Start => {
                        if let Err(e) = recorder.start() {
                            warn!(error = %e, "Failed to start recording.");
                            let _ = events.send(SessionEvent::CaptureFailed(e.to_string()));
                        }
                    }
                    CaptureJob::Finish => {
                        let result = recorder.finish().map_err(|e| e.to_string());
                        let _ = events.send(SessionEvent::CaptureFinished(result));
                    }
                    CaptureJob::Abort => recorder.abort(),
                }
            }
            recorder.abort();
        });
        Self {
            jobs: Some(jobs),
            task: Some(task),
        }
    }

    pub fn start(&self) {
        self.submit(CaptureJob::Start);
    }

    pub fn finish(&self) {
        self.submit(CaptureJob::Finish);
    }

    pub fn abort(&self) {
        self.submit(CaptureJob::Abort);
    }

    /// Discards any capture in progress and waits for the worker to exit.
    pub async fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                error!("Capture worker panicked.");
            }
        }
    }

    fn submit(&self, job: CaptureJob) {
        let sent = self.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !sent {
            debug!(?job, "Capture worker is shut down; dropping request.");
        }
    }
}

/// Grants access when a default input device with a usable configuration exists.
pub struct CpalMicrophone;

#[async_trait]
impl MicrophoneAccess for CpalMicrophone {
    async fn request(&self) -> Permission {
        let available = tokio::task::spawn_blocking(|| {
            cpal::default_host()
                .default_input_device()
                .and_then(|device| device.default_input_config().ok())
                .is_some()
        })
        .await
        .unwrap_or(false);

        if available {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }
}

struct RawCapture {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

struct ActiveCapture {
    stop_tx: mpsc::Sender<()>,
    worker: thread::JoinHandle<Result<RawCapture, VoiceError>>,
}

impl ActiveCapture {
    fn stop(self) -> Result<RawCapture, VoiceError> {
        let _ = self.stop_tx.send(());
        self.worker
            .join()
            .map_err(|_| VoiceError::Device("Capture thread panicked".to_string()))?
    }
}

/// Records from the system's default input device.
#[derive(Default)]
pub struct CpalRecorder {
    active: Option<ActiveCapture>,
}

impl CpalRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioRecorder for CpalRecorder {
    fn start(&mut self) -> Result<(), VoiceError> {
        if self.active.is_some() {
            return Err(VoiceError::Device("Capture already running".to_string()));
        }
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || capture_until_stopped(ready_tx, stop_rx))
            .map_err(device_error)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Microphone capture started.");
                self.active = Some(ActiveCapture { stop_tx, worker });
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(VoiceError::Device(message))
            }
            Err(_) => Err(VoiceError::Device(
                "Capture thread exited during start".to_string(),
            )),
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>, VoiceError> {
        let active = self
            .active
            .take()
            .ok_or_else(|| VoiceError::Device("No capture in progress".to_string()))?;
        let raw = active.stop()?;
        debug!(
            samples = raw.samples.len(),
            sample_rate = raw.sample_rate,
            channels = raw.channels,
            "Microphone capture stopped."
        );
        audio::prepare_capture(&raw.samples, raw.sample_rate, raw.channels)
    }

    fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop();
            debug!("Microphone capture discarded.");
        }
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        self.abort();
    }
}

fn device_error(e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Device(e.to_string())
}

/// Body of the capture thread: opens the stream, reports readiness, records
/// until told to stop, then hands back everything it heard.
fn capture_until_stopped(
    ready_tx: mpsc::Sender<Result<(), String>>,
    stop_rx: mpsc::Receiver<()>,
) -> Result<RawCapture, VoiceError> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let (stream, sample_rate, channels) = match open_input_stream(buffer.clone()) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return Err(e);
        }
    };
    let _ = ready_tx.send(Ok(()));

    // Returns on an explicit stop or when the recorder is dropped.
    let _ = stop_rx.recv();
    drop(stream);

    let samples = buffer
        .lock()
        .map(|mut samples| std::mem::take(&mut *samples))
        .map_err(|_| VoiceError::Device("Capture buffer poisoned".to_string()))?;
    Ok(RawCapture {
        samples,
        sample_rate,
        channels,
    })
}

fn open_input_stream(
    buffer: Arc<Mutex<Vec<f32>>>,
) -> Result<(cpal::Stream, u32, u16), VoiceError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::Device("No default input device".to_string()))?;
    let supported = device.default_input_config().map_err(device_error)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let err_fn = |err: cpal::StreamError| error!("Input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| append(&buffer, data.iter().copied()),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                append(&buffer, data.iter().map(|&s| s as f32 / 32768.0))
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                append(&buffer, data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0))
            },
            err_fn,
            None,
        ),
        other => {
            return Err(VoiceError::Device(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    }
    .map_err(device_error)?;

    stream.play().map_err(device_error)?;
    Ok((stream, sample_rate, channels))
}

fn append(buffer: &Mutex<Vec<f32>>, samples: impl Iterator<Item = f32>) {
    if let Ok(mut buffer) = buffer.lock() {
        buffer.extend(samples);
    }
}
