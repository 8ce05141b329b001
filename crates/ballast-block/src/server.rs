//! NBD server: accept loop and connection lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{info, warn};

use ballast_store::ObjectClient;

use crate::config::{KeepaliveConfig, ServerConfig};
use crate::error::BlockResult;
use crate::lease::LeaseManager;
use crate::nbd::{Session, SessionContext};

/// How long sessions get to drain after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// NBD server
pub struct NbdServer {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    active_sessions: Arc<AtomicU64>,
    connection_counter: AtomicU64,
}

impl NbdServer {
    /// Bind the listener. [`NbdServer::run`] starts accepting.
    pub async fn bind(config: ServerConfig, client: Arc<ObjectClient>) -> BlockResult<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&client),
            config.lease_ttl(),
            config.heartbeat_interval(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            ctx: Arc::new(SessionContext {
                config,
                client,
                leases,
            }),
            listener,
            shutdown_tx,
            active_sessions: Arc::new(AtomicU64::new(0)),
            connection_counter: AtomicU64::new(0),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Handle that triggers shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accept connections until shutdown is signalled, then drain.
    pub async fn run(self) -> BlockResult<()> {
        info!(addr = %self.listener.local_addr()?, "NBD server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_session(stream, peer),
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, draining sessions");
                    break;
                }
            }
        }

        self.drain_sessions().await;
        info!("NBD server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = configure_keepalive(&stream, &self.ctx.config.keepalive) {
            warn!(%peer, "failed to enable TCP keepalive: {e}");
        }

        let id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown_tx.subscribe();
        let active = Arc::clone(&self.active_sessions);
        active.fetch_add(1, Ordering::SeqCst);

        info!(session = id, %peer, "accepted NBD connection");
        tokio::spawn(async move {
            let session = Session::new(stream, peer, id, ctx, shutdown);
            match session.run().await {
                Ok(()) => info!(session = id, %peer, "session closed"),
                Err(e) => warn!(session = id, %peer, "session ended with error: {e}"),
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn drain_sessions(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active_sessions.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_sessions.load(Ordering::SeqCst),
                    "sessions did not drain before deadline"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Clonable trigger for server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    /// Signal the server to stop accepting and drain sessions.
    pub fn signal(&self) {
        let _ = self.0.send(());
    }
}

/// Dead-peer detection: lease release depends on noticing disconnects.
fn configure_keepalive(stream: &TcpStream, config: &KeepaliveConfig) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(config.idle_secs))
        .with_interval(Duration::from_secs(config.interval_secs));
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(config.probes);

    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig::default().bind("127.0.0.1", 0);
        let client = Arc::new(ObjectClient::in_memory());
        let server = NbdServer::bind(config, client).await.unwrap();

        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let config = ServerConfig::default().bind("127.0.0.1", 0);
        let client = Arc::new(ObjectClient::in_memory());
        let server = NbdServer::bind(config, client).await.unwrap();
        let shutdown = server.shutdown_handle();

        let task = tokio::spawn(server.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.signal();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run() returned after shutdown")
            .unwrap()
            .unwrap();
    }
}
