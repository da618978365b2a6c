//! WebSocket server for one shared canvas.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── GridStore
//!             ├── connection task ──┤   PresenceRegistry   (one Mutex)
//! Client B ──┘        │             └── broadcast::Sender
//!                     │                        │
//!                     ◄──── Subscription ◄─────┘
//! ```
//!
//! Per connection:
//! 1. WebSocket handshake; `?format=json|binary` picks the initial encoding.
//! 2. `init` goes out before any inbound frame is read.
//! 3. `select!` over inbound frames, fan-out envelopes and heartbeat ticks.
//! 4. On exit the connection's presence is dropped (`playerLeft` if last).
//!
//! Replies use whichever encoding the client last sent. Malformed frames
//! are counted and dropped; only transport failure or falling behind the
//! fan-out buffer ends a connection.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastHub, HubConfig, HubError};
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{ClientMessage, ConnectionId, ProtocolError, ServerMessage, WireFormat};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Inbound data frames, well-formed or not.
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    /// TCP connections turned away by `maxConnections`.
    pub refused_connections: u64,
}

/// The canvas server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<BroadcastHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Build the authoritative grid and hub from `config`.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let grid = config.canvas.build_grid()?;
        let hub = Arc::new(BroadcastHub::new(grid, HubConfig::from(&config)));
        Ok(Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Canvas server listening on {} ({}x{})",
            listener.local_addr()?,
            self.config.canvas.width,
            self.config.canvas.height
        );
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), BoxError> {
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs);
        loop {
            let (stream, addr) = listener.accept().await?;

            {
                let mut s = self.stats.write().await;
                if s.active_connections >= self.config.max_connections as u64 {
                    s.refused_connections += 1;
                    log::warn!(
                        "Refusing {addr}: {} connections already open",
                        s.active_connections
                    );
                    continue;
                }
                s.total_connections += 1;
                s.active_connections += 1;
            }
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats.clone(), heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<BroadcastHub>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let mut format = WireFormat::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                format = WireFormat::from_query(request.uri().query());
                Ok(response)
            },
        )
        .await?;

        let connection = ConnectionId::new();
        log::info!(
            "WebSocket connection {connection} established from {addr} ({})",
            format.query_value()
        );

        let result = Self::serve(ws_stream, addr, connection, format, &hub, &stats, heartbeat).await;

        hub.disconnect(connection).await;
        log::info!("Connection {connection} from {addr} closed");
        result
    }

    async fn serve(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        connection: ConnectionId,
        mut format: WireFormat,
        hub: &BroadcastHub,
        stats: &RwLock<ServerStats>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (init, mut subscription) = hub.connect(connection).await;
        send(&mut ws_sender, &init, format).await?;

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(data))) => {
                            format = WireFormat::Binary;
                            count_frame(stats, data.len()).await;
                            ClientMessage::decode_binary(&data)
                        }
                        Some(Ok(Message::Text(text))) => {
                            format = WireFormat::Json;
                            count_frame(stats, text.len()).await;
                            ClientMessage::decode_json(text.as_str())
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            log::trace!("Heartbeat pong from {addr}");
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Frame(_))) => continue,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    };

                    match decoded {
                        Ok(message) => {
                            if let Some(reply) = Self::dispatch(hub, connection, message).await {
                                send(&mut ws_sender, &reply, format).await?;
                            }
                        }
                        Err(e) => {
                            stats.write().await.malformed_messages += 1;
                            log::warn!("Dropping malformed frame from {addr}: {e}");
                        }
                    }
                }

                envelope = subscription.recv() => {
                    match envelope {
                        Ok(envelope) => send(&mut ws_sender, &envelope.message, format).await?,
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection} lagged by {n} messages, disconnecting");
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }

        Ok(())
    }

    /// Apply one client message. Returns the direct reply, if any.
    async fn dispatch(
        hub: &BroadcastHub,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> Option<ServerMessage> {
        match message {
            ClientMessage::Join { id } => {
                match hub.join(connection, id).await {
                    Ok(_) => {}
                    Err(HubError::PresenceDisabled) => {
                        log::debug!("Ignoring join from {connection}: presence disabled");
                    }
                    Err(e) => log::warn!("Join from {connection} refused: {e}"),
                }
                None
            }
            ClientMessage::CellChange(change) => {
                match hub.cell_change(connection, change.clone()).await {
                    Ok(_) => None,
                    Err(e) => hub.rejection_for(&change, &e),
                }
            }
            ClientMessage::Ping => Some(ServerMessage::Pong),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn count_frame(stats: &RwLock<ServerStats>, len: usize) {
    let mut s = stats.write().await;
    s.total_messages += 1;
    s.total_bytes += len as u64;
}

async fn send(
    sink: &mut WsSink,
    message: &ServerMessage,
    format: WireFormat,
) -> Result<(), BoxError> {
    let frame = message.encode(format)?;
    log::trace!("Sending {} ({} bytes)", message.label(), frame.len());
    match sink.send(frame.into()).await {
        Ok(()) => Ok(()),
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
            Err(ProtocolError::ConnectionClosed.into())
        }
        Err(e) => Err(e.into()),
    }
}
