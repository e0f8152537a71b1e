//! WebSocket telemetry server.
//!
//! Architecture:
//! ```text
//! Publisher ──┐                                   ┌──► Dashboard A
//!             ├── connection task ── Hub ── Room ─┤
//! Dashboard ──┘     (one per socket)     │        └──► Dashboard B
//!                                        └── StoreRegistry ── <root>/<room>/events.jsonl
//! ```
//!
//! Each connection gets one hub session. The connection task multiplexes the
//! socket reader with the session's outbound queue; the hub is the only place
//! room state lives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{Hub, HubConfig, Session};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{StorageConfig, StoreError, StoreRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Event persistence
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outbound_capacity: 1024,
            storage: StorageConfig::Memory,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            outbound_capacity: 256,
            storage: StorageConfig::Memory,
        }
    }

    fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that were not valid client messages
    pub decode_failures: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    decode_failures: AtomicU64,
}

/// The telemetry server.
pub struct StreamServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<AtomicServerStats>,
}

impl StreamServer {
    /// Create a server; opens the storage root when persistence is enabled.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let registry = StoreRegistry::new(config.storage.clone())?;
        let hub = Arc::new(Hub::new(config.hub_config(), registry));
        Ok(Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Open the rooms persisted by a previous run.
    ///
    /// Returns the number of rooms recovered.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let recovered = self.hub.recover()?;
        for (room_id, len) in &recovered {
            log::info!("Recovered room {room_id} with {len} events");
        }
        Ok(recovered.len())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover()?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Telemetry server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    stats: Arc<AtomicServerStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;

    stats.total_connections.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut session = hub.open_session().await;
    log::info!("WebSocket connection established from {addr} (session {})", session.id);

    let result = drive_session(ws_stream, addr, &hub, &mut session, &stats).await;

    // Always release memberships, whatever ended the connection
    if hub.leave(session.id).await.is_err() {
        log::trace!("Session {} already left", session.id);
    }
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn drive_session(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    hub: &Hub,
    session: &mut Session,
    stats: &AtomicServerStats,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                        let client_msg = match ClientMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        match client_msg {
                            ClientMessage::Join { session_id, rooms } => {
                                log::debug!(
                                    "Session {} ({}) joining {rooms:?}",
                                    session.id,
                                    session_id.as_deref().unwrap_or("anonymous")
                                );
                                if let Err(e) = hub.join(session.id, &rooms).await {
                                    log::error!("Join from {addr} failed: {e}");
                                }
                            }
                            ClientMessage::Leave => {
                                hub.leave(session.id).await?;
                                // Flush what the hub queued before the leave
                                while let Ok(msg) = session.outbound.try_recv() {
                                    ws_sender.send(Message::Text(msg.encode()?.into())).await?;
                                }
                                ws_sender.send(Message::Close(None)).await?;
                                log::info!("Session {} left, closing {addr}", session.id);
                                break;
                            }
                            ClientMessage::Ping => {
                                let pong = ServerMessage::Pong.encode()?;
                                ws_sender.send(Message::Text(pong.into())).await?;
                            }
                            ClientMessage::MlgymEvent(raw) => {
                                if let Err(e) = hub.publish_raw(raw).await {
                                    log::error!("Publish from {addr} failed: {e}");
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Binary(data))) => {
                        stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Ignoring {} byte binary frame from {addr}", data.len());
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outgoing hub message
            msg = session.recv() => {
                match msg {
                    Some(msg) => {
                        let text = msg.encode()?;
                        ws_sender.send(Message::Text(text.into())).await?;
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, JobStatus};
    use serde_json::Map;
    use tempfile::tempdir;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn test_server_config_for_testing() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = StreamServer::new(ServerConfig::for_testing()).unwrap();
        let stats = server.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.decode_failures, 0);
        assert_eq!(server.hub().stats().await.rooms, 0);
    }

    #[test]
    fn test_server_recovery_in_memory() {
        let server = StreamServer::new(ServerConfig::for_testing()).unwrap();
        assert_eq!(server.recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_recovery_with_storage() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            storage: StorageConfig::disk(dir.path()),
            ..ServerConfig::for_testing()
        };

        {
            let server = StreamServer::new(config.clone()).unwrap();
            let event = Event::job_status(JobStatus {
                room_id: "gs-1".to_string(),
                job_id: "0".to_string(),
                job_type: "train".to_string(),
                status: "done".to_string(),
                device: None,
                error: None,
                extra: Map::new(),
            });
            server.hub().publish(event).await.unwrap();
        }

        let server = StreamServer::new(config).unwrap();
        assert_eq!(server.recover().unwrap(), 1);
        assert_eq!(server.hub().registry().get("gs-1").unwrap().len(), 1);
    }
}
