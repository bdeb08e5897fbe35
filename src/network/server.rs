//! WebSocket Game Server
//!
//! Async WebSocket binding for the networked channel. Each socket gets a
//! transport id, runs the `hello` handshake through the connection gate and,
//! once approved, feeds its messages into the `NetworkedChannel`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::HostConfig;
use crate::game::participant::{ParticipantId, SYNTHETIC_ID_BASE};
use crate::network::gate::{ConnectionGate, ConnectionRequest, ConnectionResponse};
use crate::network::networked::NetworkedChannel;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport ids ran into the synthetic range.
    #[error("Transport id space exhausted")]
    IdsExhausted,
}

type Reader = SplitStream<WebSocketStream<TcpStream>>;

/// Shared per-connection state.
struct ServerShared {
    config: HostConfig,
    gate: Arc<ConnectionGate>,
    channel: Arc<NetworkedChannel>,
    next_id: AtomicU64,
    connections: AtomicUsize,
    shutdown: CancellationToken,
}

/// The game server.
pub struct GameServer {
    shared: Arc<ServerShared>,
}

impl GameServer {
    /// Create a server in front of `gate` and `channel`.
    pub fn new(config: HostConfig, gate: Arc<ConnectionGate>, channel: Arc<NetworkedChannel>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                gate,
                channel,
                next_id: AtomicU64::new(1),
                connections: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Run the accept loop until `shutdown` is called.
    #[instrument(skip(self), fields(addr = %self.shared.config.bind_addr))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        info!("Game server listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let active = self.shared.connections.load(Ordering::Acquire);
                            if active >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            let id = self.allocate_id()?;
                            info!(participant = %id, "New connection from {}", addr);
                            self.handle_connection(stream, id);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shared.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    fn allocate_id(&self) -> Result<ParticipantId, GameServerError> {
        let raw = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if raw >= SYNTHETIC_ID_BASE {
            return Err(GameServerError::IdsExhausted);
        }
        Ok(ParticipantId(raw))
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, id: ParticipantId) {
        let shared = Arc::clone(&self.shared);
        shared.connections.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!(participant = %id, "WebSocket handshake failed: {}", e);
                    shared.connections.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            if let Some(response) = Self::handshake(&shared, id, &mut ws_receiver, &msg_tx).await {
                info!(participant = %id, name = ?response.display_name, "Participant joined");
                shared.channel.register(id, msg_tx.clone());
                Self::play(&shared, id, &mut ws_receiver, &msg_tx).await;
                shared.channel.remove(id);
            }
            // No-op for attempts the gate never tracked.
            shared.gate.on_disconnect(id);

            // Let queued messages (rejections, shutdown notices) drain.
            drop(msg_tx);
            let _ = sender_task.await;
            shared.connections.fetch_sub(1, Ordering::AcqRel);
            debug!(participant = %id, "Connection cleaned up");
        });
    }

    /// Wait for `hello`, run it through the gate and, if pending, keep
    /// watching the socket until the gate decides. Returns the approval.
    async fn handshake(
        shared: &ServerShared,
        id: ParticipantId,
        reader: &mut Reader,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Option<ConnectionResponse> {
        let hello = loop {
            let text = tokio::select! {
                _ = shared.shutdown.cancelled() => return None,
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                    _ => continue,
                },
            };
            match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Hello(hello)) => break hello,
                Ok(ClientMessage::Ping { timestamp }) => {
                    let _ = sender.send(pong(timestamp)).await;
                }
                Ok(_) => {
                    let _ = sender
                        .send(ServerMessage::error(ErrorCode::NotApproved, "send hello first"))
                        .await;
                }
                Err(e) => {
                    debug!(participant = %id, "Invalid message: {}", e);
                    let _ = sender
                        .send(ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format"))
                        .await;
                }
            }
        };

        let admission = shared
            .gate
            .admit(ConnectionRequest::new(id, hello.payload));
        let _ = sender
            .send(ServerMessage::Connection(admission.response.clone()))
            .await;
        if admission.deferred.is_none() {
            return admission.response.approved.then_some(admission.response);
        }

        let decision = admission.finalize();
        tokio::pin!(decision);
        loop {
            tokio::select! {
                response = &mut decision => {
                    let _ = sender.send(ServerMessage::Connection(response.clone())).await;
                    return response.approved.then_some(response);
                }
                msg = reader.next() => match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                    Some(Ok(Message::Text(_))) => {
                        let _ = sender
                            .send(ServerMessage::error(ErrorCode::NotApproved, "approval pending"))
                            .await;
                    }
                    _ => {}
                },
            }
        }
    }

    /// Route messages from an approved participant until it leaves.
    async fn play(
        shared: &ServerShared,
        id: ParticipantId,
        reader: &mut Reader,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        loop {
            tokio::select! {
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let client_msg = match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!(participant = %id, "Invalid message: {}", e);
                                    let _ = sender
                                        .send(ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format"))
                                        .await;
                                    continue;
                                }
                            };
                            match client_msg {
                                ClientMessage::Ping { timestamp } => {
                                    let _ = sender.send(pong(timestamp)).await;
                                }
                                ClientMessage::Hello(_) => {
                                    let _ = sender
                                        .send(ServerMessage::error(ErrorCode::AlreadyJoined, "already joined"))
                                        .await;
                                }
                                ClientMessage::Leave => {
                                    debug!(participant = %id, "Participant left");
                                    break;
                                }
                                other => {
                                    shared.channel.receive(id, other);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(participant = %id, "Client disconnected");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(participant = %id, "WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shared.shutdown.cancelled() => {
                    let _ = sender.send(ServerMessage::Shutdown {
                        reason: "Server shutting down".to_string(),
                    }).await;
                    break;
                }
            }
        }
    }

    /// Stop accepting and tell connected clients.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Token cancelled by `shutdown`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }
}

fn pong(timestamp: u64) -> ServerMessage {
    ServerMessage::Pong {
        timestamp,
        server_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::Signal;
    use crate::network::auth::OpenValidator;
    use crate::network::tracker::ConnectionTracker;
    use tokio_tungstenite::connect_async;

    fn server(required: usize) -> (GameServer, Arc<ConnectionGate>) {
        let gate = Arc::new(ConnectionGate::new(
            Arc::new(ConnectionTracker::new(required)),
            Arc::new(OpenValidator),
            Signal::new(),
        ));
        let config = HostConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config, gate.clone(), Arc::new(NetworkedChannel::new()));
        (server, gate)
    }

    async fn next_server_message<S>(ws: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.expect("socket closed").expect("socket error") {
                Message::Text(text) => return ServerMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_transport_ids_below_synthetic_range() {
        let (server, _) = server(2);
        let first = server.allocate_id().unwrap();
        let second = server.allocate_id().unwrap();
        assert_eq!(first, ParticipantId(1));
        assert_eq!(second, ParticipantId(2));
        assert!(!first.is_synthetic());

        server.shared.next_id.store(SYNTHETIC_ID_BASE, Ordering::Relaxed);
        assert!(matches!(server.allocate_id(), Err(GameServerError::IdsExhausted)));
    }

    #[tokio::test]
    async fn test_server_shutdown_stops_accept_loop() {
        let (server, _) = server(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.shutdown();
        server.serve(listener).await.unwrap();
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_hello_handshake_pending_then_approved() {
        let (server, gate) = server(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let hello = r#"{"type":"hello","payload":{"name":"ana"}}"#;
        ws.send(Message::Text(hello.to_string())).await.unwrap();

        let ServerMessage::Connection(first) = next_server_message(&mut ws).await else {
            panic!("expected connection response");
        };
        assert!(first.pending);

        gate.mark_gameplay_ready();
        let ServerMessage::Connection(last) = next_server_message(&mut ws).await else {
            panic!("expected connection response");
        };
        assert!(last.approved);
        assert_eq!(last.display_name.as_deref(), Some("ana"));

        server.shutdown();
        assert!(matches!(
            next_server_message(&mut ws).await,
            ServerMessage::Shutdown { .. }
        ));
        serving.await.unwrap().unwrap();
    }
}
