//! Conversation socket.
//!
//! One [`Connection`] is one socket attempt. Its task reports `ConnectionOpened`,
//! every text frame as `MessageReceived`, an optional `ConnectionError`, and
//! always finishes with exactly one `ConnectionClosed`.

use crate::runtime::EventSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};
use tripot_core::{SessionEvent, VoiceError};

enum Outbound {
    Text(String),
    Close,
}

pub struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Starts connecting to `url` in the background.
    pub fn open(url: String, events: EventSink) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(url, outbound_rx, events));
        Self { outbound, task }
    }

    /// Queues a text frame.
    pub fn send_text(&self, text: String) -> Result<(), VoiceError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| VoiceError::Connection("Socket task is gone".to_string()))
    }

    /// Asks the socket to close normally. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Closes the socket and waits up to `grace` for the close handshake.
    pub async fn shutdown(self, grace: Duration) {
        let Connection { outbound, mut task } = self;
        let _ = outbound.send(Outbound::Close);
        drop(outbound);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("Socket did not close in time; aborting.");
            task.abort();
        }
    }
}

async fn run_connection(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: EventSink,
) {
    let (code, reason) = match drive(&url, &mut outbound_rx, &events).await {
        Ok(closed) => closed,
        Err(e) => {
            warn!(%url, error = %e, "Conversation socket failed.");
            let _ = events.send(SessionEvent::ConnectionError(e.to_string()));
            (None, e.to_string())
        }
    };
    info!(?code, %reason, "Conversation socket closed.");
    let _ = events.send(SessionEvent::ConnectionClosed { code, reason });
}

fn connection_error(e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Connection(e.to_string())
}

/// Runs one socket until it closes, returning the close code and reason.
async fn drive(
    url: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &EventSink,
) -> Result<(Option<u16>, String), VoiceError> {
    debug!(%url, "Connecting conversation socket.");
    let ws_stream = tokio::select! {
        connected = connect_async(url) => connected.map_err(connection_error)?.0,
        _ = close_requested(outbound_rx) => {
            return Ok((None, "Closed before the socket opened".to_string()));
        }
    };
    let (mut sink, mut stream) = ws_stream.split();
    let _ = events.send(SessionEvent::ConnectionOpened);

    let mut closing = false;
    loop {
        tokio::select! {
            outbound = outbound_rx.recv(), if !closing => match outbound {
                Some(Outbound::Text(text)) => {
                    debug!(bytes = text.len(), "Sending text frame.");
                    sink.send(Message::Text(text.into())).await.map_err(connection_error)?;
                }
                Some(Outbound::Close) | None => {
                    closing = true;
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    sink.send(Message::Close(Some(frame))).await.map_err(connection_error)?;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SessionEvent::MessageReceived(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new())));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(connection_error(e)),
                None => return Ok((None, String::new())),
            },
        }
    }
}

/// Resolves once a close is requested, dropping frames queued before open.
async fn close_requested(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Close => return,
            Outbound::Text(_) => warn!("Dropping frame queued before the socket opened."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _connection = Connection::open(format!("ws://{}/ws", addr), tx);

        assert!(matches!(
            next_event(&mut rx).await,
            SessionEvent::ConnectionError(_)
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            SessionEvent::ConnectionClosed { code: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_text_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"type":"ai_message","content":"hi"}"#.into()))
                .await
                .unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {:?}", other),
                }
            };
            // Drain until the client's close frame has been answered.
            while let Some(Ok(_)) = ws.next().await {}
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::open(format!("ws://{}/ws", addr), tx);

        assert_eq!(next_event(&mut rx).await, SessionEvent::ConnectionOpened);
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::MessageReceived(r#"{"type":"ai_message","content":"hi"}"#.to_string())
        );

        connection.send_text("UklGRg==".to_string()).unwrap();
        connection.close();

        assert_eq!(server.await.unwrap(), "UklGRg==");
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::ConnectionClosed {
                code: Some(1000),
                reason: String::new(),
            }
        );
    }
}
