//! WebSocket server implementation
//!
//! Accepts TCP connections and hands each one to its own connection handler
//! task. The server owns the room registry for its whole lifetime; nothing
//! survives a restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use super::handler::{ConnectionHandler, RelayContext};
use crate::config::RelayConfig;
use crate::room::RoomRegistry;

/// How long shutdown waits for connections to leave their rooms
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket server relaying chat rooms
pub struct WebSocketServer {
    config: RelayConfig,
    ctx: Arc<RelayContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = Arc::new(RelayContext {
            registry: Arc::new(RoomRegistry::with_send_timeout(config.send_timeout())),
            verifier: config.token_verifier(),
            outbound_buffer: config.relay.outbound_buffer,
            echo_to_sender: config.relay.echo_to_sender,
        });
        Self {
            config,
            ctx,
            shutdown_tx,
        }
    }

    /// The room registry shared by all connections
    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener
    ///
    /// Each connection runs in its own task; the loop returns to accepting
    /// immediately. Returns once a shutdown signal is received and every
    /// connection has finished (or the drain timeout has passed).
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}/ws/{{room}} ({} tokens)",
            local_addr,
            self.ctx.verifier.algorithm()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let handler = ConnectionHandler::new(peer_addr, Arc::clone(&self.ctx));
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let span = info_span!("connection", peer = %peer_addr);

                            connections.spawn(
                                async move {
                                    let outcome = handler.run(stream, shutdown_rx).await;
                                    tracing::debug!(?outcome, "Connection finished");
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let rooms = self.ctx.registry.room_names().await;
        if !rooms.is_empty() {
            info!(
                "Closing {} connections in {} active rooms: {}",
                connections.len(),
                rooms.len(),
                rooms.join(", ")
            );
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                SHUTDOWN_DRAIN_TIMEOUT
            );
            connections.shutdown().await;
        }
        let rooms = self.ctx.registry.room_count().await;
        info!(rooms, "Connections drained");

        Ok(())
    }
}
