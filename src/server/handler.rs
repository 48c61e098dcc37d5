//! WebSocket connection handler
//!
//! Drives one client connection through its lifecycle:
//! `Connecting → Authenticating → Joined → Relaying → Disconnecting → Terminated`.
//!
//! Authentication happens inside the upgrade handshake, so a refused client
//! never completes the upgrade and never touches the registry. Once joined,
//! the socket is split: this task reads and fans out, a writer task drains
//! the member's outbound queue into the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{RoomEvent, UpgradeTarget};
use crate::auth::{Identity, TokenVerifier};
use crate::room::{Member, RoomRegistry, RoomState};

/// How long a closing connection waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state handed to every connection
pub struct RelayContext {
    /// Room membership shared by all connections
    pub registry: Arc<RoomRegistry>,
    /// Verifier for upgrade credentials
    pub verifier: TokenVerifier,
    /// Outbound queue length per member
    pub outbound_buffer: usize,
    /// Whether chat lines are echoed back to their sender
    pub echo_to_sender: bool,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Joined,
    Relaying,
    Disconnecting,
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Joined => "joined",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a joined connection stopped relaying
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a close frame
    ClientClosed,
    /// Stream ended without a close frame
    StreamEnded,
    /// Reading from the socket failed
    ReadError(String),
    /// The server is shutting down
    Shutdown,
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The upgrade was refused or never completed
    Refused,
    /// The connection joined a room and later left it
    Closed(DisconnectReason),
}

/// Result of inspecting the upgrade request
#[derive(Debug)]
enum Admission {
    Pending,
    Accepted {
        room: String,
        identity: Identity,
    },
    Refused {
        status: StatusCode,
        reason: String,
        token: Option<String>,
    },
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    peer_addr: SocketAddr,
    ctx: Arc<RelayContext>,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(peer_addr: SocketAddr, ctx: Arc<RelayContext>) -> Self {
        Self {
            peer_addr,
            ctx,
            state: ConnectionState::Connecting,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(peer = %self.peer_addr, from = %self.state, to = %next, "Connection state change");
        self.state = next;
    }

    /// Run the connection to completion
    pub async fn run<S>(
        mut self,
        stream: S,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ConnectionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some((ws_stream, room, identity)) = self.authenticate(stream).await else {
            self.transition(ConnectionState::Terminated);
            return ConnectionOutcome::Refused;
        };

        self.transition(ConnectionState::Joined);
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.ctx.outbound_buffer);
        let mut writer = tokio::spawn(write_outbound(ws_sender, outbound_rx));

        // The registry holds the only sender; leaving closes the queue
        let member = Member::new(identity.clone(), outbound_tx);
        let member_id = member.id();
        self.ctx.registry.join(&room, member).await;
        let members = self.ctx.registry.member_count(&room).await;
        info!(peer = %self.peer_addr, %room, %identity, members, "User joined room");

        self.transition(ConnectionState::Relaying);
        self.ctx
            .registry
            .broadcast(&room, &RoomEvent::joined(&identity).to_string(), Some(member_id))
            .await;

        let chat_exclude = if self.ctx.echo_to_sender {
            None
        } else {
            Some(member_id)
        };

        let reason = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!(%room, %identity, "Received message: {}", text);
                            let line = RoomEvent::chat(&identity, &text).to_string();
                            let report = self.ctx.registry.broadcast(&room, &line, chat_exclude).await;
                            debug!(%room, delivered = report.delivered, failed = report.failed, "Fanout complete");
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!(%room, %identity, "Received binary message ({} bytes), ignoring", data.len());
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // Pongs are queued by tungstenite itself
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => break DisconnectReason::ClientClosed,
                        Some(Err(e)) => break DisconnectReason::ReadError(e.to_string()),
                        None => break DisconnectReason::StreamEnded,
                    }
                }
                _ = shutdown_rx.recv() => break DisconnectReason::Shutdown,
            }
        };

        self.transition(ConnectionState::Disconnecting);
        match &reason {
            DisconnectReason::ReadError(e) => {
                info!(%room, %identity, "Connection lost: {}", e);
            }
            other => info!(%room, %identity, reason = ?other, "User left room"),
        }

        match self.ctx.registry.leave(&room, member_id).await {
            Some(RoomState::Occupied { .. }) => {
                self.ctx
                    .registry
                    .broadcast(&room, &RoomEvent::left(&identity).to_string(), None)
                    .await;
            }
            Some(RoomState::Empty) => debug!(%room, "Room is now empty"),
            None => {}
        }

        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
            Ok(Ok(mut sink)) => {
                if reason == DisconnectReason::Shutdown {
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "server shutting down".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                } else {
                    let _ = sink.close().await;
                }
            }
            Ok(Err(e)) => warn!(peer = %self.peer_addr, "Writer task failed: {}", e),
            Err(_) => {
                // Peer stopped reading; drop the socket with whatever is queued
                debug!(peer = %self.peer_addr, "Writer did not drain in time, aborting");
                writer.abort();
            }
        }

        self.transition(ConnectionState::Terminated);
        ConnectionOutcome::Closed(reason)
    }

    /// Verify the upgrade request and complete the handshake if it is valid
    async fn authenticate<S>(
        &mut self,
        stream: S,
    ) -> Option<(WebSocketStream<S>, String, Identity)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(ConnectionState::Authenticating);

        let ctx = Arc::clone(&self.ctx);
        let mut admission = Admission::Pending;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            admission = admit(req, &ctx.verifier);
            match &admission {
                Admission::Refused { status, reason, .. } => Err(refusal(*status, reason)),
                _ => Ok(response),
            }
        };

        let result = accept_hdr_async(stream, callback).await;

        match (result, admission) {
            (Ok(ws_stream), Admission::Accepted { room, identity }) => {
                Some((ws_stream, room, identity))
            }
            (
                _,
                Admission::Refused {
                    status,
                    reason,
                    token,
                },
            ) => {
                match token {
                    Some(token) => warn!(
                        peer = %self.peer_addr,
                        "Invalid token: {} ({})", token, reason
                    ),
                    None => warn!(
                        peer = %self.peer_addr,
                        status = status.as_u16(),
                        "Refused upgrade: {}", reason
                    ),
                }
                None
            }
            (Err(e), _) => {
                debug!(peer = %self.peer_addr, "Handshake failed: {}", e);
                None
            }
            (Ok(_), Admission::Pending) => None,
        }
    }
}

/// Decide whether an upgrade request may join a room
fn admit(req: &Request, verifier: &TokenVerifier) -> Admission {
    let target = match UpgradeTarget::parse(req.uri().path(), req.uri().query()) {
        Ok(target) => target,
        Err(e) => {
            return Admission::Refused {
                status: e.status(),
                reason: e.to_string(),
                token: None,
            }
        }
    };

    match verifier.verify(&target.token) {
        Ok(identity) => Admission::Accepted {
            room: target.room,
            identity,
        },
        // Policy violation: refused before the upgrade is accepted
        Err(rejection) => Admission::Refused {
            status: StatusCode::FORBIDDEN,
            reason: rejection.to_string(),
            token: Some(target.token),
        },
    }
}

fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Drain a member's outbound queue into its socket
///
/// Returns the sink once the queue is closed or a write fails, so the caller
/// can finish the close handshake.
async fn write_outbound<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<String>,
) -> SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = outbound_rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("Write failed, dropping outbound queue: {}", e);
            break;
        }
    }
    sink
}
