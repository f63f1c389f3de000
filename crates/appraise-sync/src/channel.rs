//! Push channel manager: long-lived server connection with reconnect.
//!
//! The manager runs a `Disconnected -> Connecting -> Connected` state machine
//! over an abstract transport, so the reconnect logic is testable without a
//! real socket. Decoded notifications are applied through the same dispatch
//! path as manually constructed ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::{PushUpdate, apply_push_update, decode_push_message};
use crate::error::ChannelError;
use crate::store::EntityStore;

/// Default base delay for reconnect backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Give up on a silent connection after this long.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Externally observable channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Not connected; no connection has been attempted yet, or the channel
    /// was shut down cleanly.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Live; inbound notifications are being applied.
    Connected,
    /// Connection lost; reconnect attempt `attempt` is pending.
    Reconnecting { attempt: u32 },
    /// Terminal: reconnect attempts exhausted. Interval polling remains the
    /// freshness fallback; the channel does not retry on its own.
    Offline,
}

/// One event from an established connection.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A text payload to decode and apply.
    Text(String),
    /// The peer closed the connection. `clean` distinguishes a normal close
    /// from an abnormal one that warrants reconnecting.
    Closed { clean: bool },
}

/// Connects to the push endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, ChannelError>;
}

/// An established push connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError>;
}

/// WebSocket-backed production transport.
pub struct WebSocketTransport;

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushConnection>, ChannelError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ChannelEvent::Text(text.to_string())),
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite auto-responds to pings
                    trace!("received ping");
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    return Ok(ChannelEvent::Closed { clean });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                None => return Ok(ChannelEvent::Closed { clean: false }),
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    CleanClose,
    Abnormal(&'static str),
}

/// Long-lived push connection with automatic reconnect.
///
/// Abnormal closes reconnect with linear backoff (`base_delay * attempt`);
/// the attempt counter resets on every successful connection. Once
/// `max_attempts` consecutive attempts fail the manager goes terminally
/// [`ChannelStatus::Offline`].
pub struct PushChannel {
    store: Arc<EntityStore>,
    transport: Arc<dyn PushTransport>,
    url: String,
    base_delay: Duration,
    max_attempts: u32,
    status_tx: watch::Sender<ChannelStatus>,
}

impl PushChannel {
    /// Create a channel manager for the given endpoint.
    pub fn new(
        url: impl Into<String>,
        store: Arc<EntityStore>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            store,
            transport,
            url: url.into(),
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            status_tx,
        }
    }

    /// Override the reconnect backoff parameters.
    pub fn with_backoff(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.base_delay = base_delay;
        self.max_attempts = max_attempts;
        self
    }

    /// Observe channel status transitions.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Apply a manually constructed update through the same path as real
    /// inbound messages.
    pub fn dispatch(&self, update: &PushUpdate) {
        apply_push_update(&self.store, update);
    }

    fn set_status(&self, status: ChannelStatus) {
        // send_replace records the transition even with no observers yet
        self.status_tx.send_replace(status);
    }

    /// Connect and process notifications until clean close, shutdown, or
    /// reconnect exhaustion.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ChannelError> {
        let mut attempts = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                self.set_status(ChannelStatus::Disconnected);
                return Ok(());
            }

            self.set_status(if attempts == 0 {
                ChannelStatus::Connecting
            } else {
                ChannelStatus::Reconnecting { attempt: attempts }
            });
            info!(url = %self.url, attempt = attempts, "connecting to push channel");

            match self.transport.connect(&self.url).await {
                Ok(connection) => {
                    attempts = 0;
                    self.set_status(ChannelStatus::Connected);
                    info!("push channel connected");

                    match self.process(connection, &mut shutdown_rx).await {
                        SessionEnd::Shutdown => {
                            self.set_status(ChannelStatus::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::CleanClose => {
                            info!("push channel closed cleanly");
                            self.set_status(ChannelStatus::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Abnormal(reason) => {
                            warn!(reason, "push channel dropped");
                        }
                    }
                }
                Err(connect_error) => {
                    warn!(error = %connect_error, "push channel connect failed");
                }
            }

            attempts += 1;
            if attempts >= self.max_attempts {
                error!(attempts, "push channel reconnect attempts exhausted");
                self.set_status(ChannelStatus::Offline);
                return Err(ChannelError::Exhausted { attempts });
            }

            let delay = self.base_delay * attempts;
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.set_status(ChannelStatus::Disconnected);
                        return Ok(());
                    }
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Process one established connection until it ends.
    async fn process(
        &self,
        mut connection: Box<dyn PushConnection>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("push channel received shutdown signal");
                        return SessionEnd::Shutdown;
                    }
                }

                result = tokio::time::timeout(READ_TIMEOUT, connection.next_event()) => {
                    match result {
                        Ok(Ok(ChannelEvent::Text(payload))) => {
                            match decode_push_message(&payload) {
                                Ok(update) => apply_push_update(&self.store, &update),
                                Err(decode_error) => {
                                    // one bad message never tears the channel down
                                    warn!(error = %decode_error, "dropping malformed push payload");
                                }
                            }
                        }
                        Ok(Ok(ChannelEvent::Closed { clean: true })) => return SessionEnd::CleanClose,
                        Ok(Ok(ChannelEvent::Closed { clean: false })) => {
                            return SessionEnd::Abnormal("abnormal close");
                        }
                        Ok(Err(read_error)) => {
                            warn!(error = %read_error, "push channel read error");
                            return SessionEnd::Abnormal("read error");
                        }
                        Err(_) => {
                            warn!(timeout_secs = READ_TIMEOUT.as_secs(), "push channel read timeout");
                            return SessionEnd::Abnormal("read timeout");
                        }
                    }
                }
            }
        }
    }
}
