//! WebSocket connection to the room server
//!
//! Runs in a background task driven by a command channel. The task keeps the
//! socket alive across abnormal closures, retrying on a fixed interval, and
//! surfaces every server frame as a [`ConnectionEvent`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::sync::{ClientMessage, ServerMessage};
use crate::time::{LocalClock, SystemClock};

use super::room_code::RoomId;

/// Fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Largest frame either side accepts. Audio sources travel as a single
/// base64 frame, so this bounds the size of an upload.
pub const MAX_FRAME_BYTES: usize = 128 << 20;

/// Socket limits sized for whole-track uploads
pub fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);
    config
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection task closed")]
    Closed,
}

/// Events emitted by the connection task
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket opened (initially or after a reconnect)
    Connected,
    /// A well-formed server frame, stamped with the local time it was read
    Message {
        message: ServerMessage,
        received_at: u64,
    },
    /// Socket lost. `will_retry` is false after a normal close.
    Disconnected { will_retry: bool },
    /// Connect attempt or transport failure
    Error(String),
}

/// Commands sent to the connection task
#[derive(Debug)]
pub enum ConnectionCommand {
    Send(ClientMessage),
    Close,
}

/// How a connected session ended
enum PumpExit {
    /// Close requested locally, or nobody is listening any more
    Shutdown,
    /// Server closed with a normal close code
    ClosedNormally,
    /// Anything else; reconnect
    Dropped,
}

/// Handle to communicate with the running connection
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    /// Wrap a command sender. The receiving end stands in for the socket task.
    pub fn from_sender(command_tx: mpsc::UnboundedSender<ConnectionCommand>) -> Self {
        Self { command_tx }
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        self.command_tx
            .send(ConnectionCommand::Send(message))
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Build the WebSocket URL for a room from the server's HTTP origin
pub fn ws_url(server_url: &str, room_id: &RoomId, username: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse_with_params(
        &format!("{}/ws", server_url.trim_end_matches('/')),
        &[("roomId", room_id.as_str()), ("username", username)],
    )
    .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectionError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(server_url.to_string()))?;
    Ok(url)
}

/// Manages the room WebSocket - runs in a background task
pub struct ConnectionManager {
    url: Url,
    reconnect_delay: Duration,
    clock: Arc<dyn LocalClock>,
}

impl ConnectionManager {
    pub fn new(
        server_url: &str,
        room_id: &RoomId,
        username: &str,
        reconnect_delay: Duration,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            url: ws_url(server_url, room_id, username)?,
            reconnect_delay,
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock used to stamp inbound frames
    pub fn with_clock(mut self, clock: Arc<dyn LocalClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the connection and return a handle for communication
    pub fn start(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(self.run(event_tx, command_rx));

        (ConnectionHandle { command_tx }, event_rx)
    }

    async fn run(
        self,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) {
        loop {
            info!("Connecting to {}", self.url);
            match connect_async_with_config(self.url.as_str(), Some(socket_config()), false).await {
                Ok((socket, _)) => {
                    info!("Connected to room server");
                    if event_tx.send(ConnectionEvent::Connected).is_err() {
                        return;
                    }
                    match pump(socket, self.clock.as_ref(), &event_tx, &mut command_rx).await {
                        PumpExit::Shutdown => {
                            info!("Connection closed");
                            return;
                        }
                        PumpExit::ClosedNormally => {
                            info!("Server closed the connection");
                            let _ = event_tx.send(ConnectionEvent::Disconnected { will_retry: false });
                            return;
                        }
                        PumpExit::Dropped => {
                            warn!(
                                "Connection lost, reconnecting in {}s",
                                self.reconnect_delay.as_secs_f64()
                            );
                            if event_tx
                                .send(ConnectionEvent::Disconnected { will_retry: true })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", self.url, e);
                    if event_tx.send(ConnectionEvent::Error(e.to_string())).is_err() {
                        return;
                    }
                }
            }

            // Wait out the retry interval, still honouring close requests
            let sleep = tokio::time::sleep(self.reconnect_delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = command_rx.recv() => match cmd {
                        Some(ConnectionCommand::Send(msg)) => {
                            debug!("Dropping {} while disconnected", msg.kind());
                        }
                        Some(ConnectionCommand::Close) | None => return,
                    },
                }
            }
        }
    }
}

/// Shuttle frames between the socket and the channels until the session ends
async fn pump(
    socket: Socket,
    clock: &dyn LocalClock,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
) -> PumpExit {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => match cmd {
                Some(ConnectionCommand::Send(msg)) => {
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", msg.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Send failed: {}", e);
                        return PumpExit::Dropped;
                    }
                }
                Some(ConnectionCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // t3 of a clock probe is the read instant
                    let received_at = clock.now_ms();
                    match ServerMessage::parse(&text) {
                        Ok(message) => {
                            if event_tx.send(ConnectionEvent::Message { message, received_at }).is_err() {
                                let _ = write.send(Message::Close(None)).await;
                                return PumpExit::Shutdown;
                            }
                        }
                        Err(e) => debug!("Dropping malformed frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame.is_some_and(|f| f.code == CloseCode::Normal);
                    return if normal { PumpExit::ClosedNormally } else { PumpExit::Dropped };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },
        }
    }
}
