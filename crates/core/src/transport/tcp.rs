use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::metrics::{self, Metrics};
use crate::pipeline::Pipeline;
use crate::session::ConnectionHandle;
use crate::session::factory::SessionFactory;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How often a blocked read wakes up to check the idle timer and the
/// `running` flag.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Connections beyond `max_connections` are dropped on accept.
pub fn accept_loop(
    listener: TcpListener,
    factory: Arc<SessionFactory>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    let metrics = factory.metrics();
    let max_connections = factory.config().max_connections;

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let Some(slot) = ConnectionSlot::acquire(&active, max_connections) else {
                    metrics::incr(&metrics.connections_rejected);
                    tracing::warn!(
                        %peer_addr,
                        max_connections,
                        "connection limit reached, refusing"
                    );
                    continue;
                };
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                metrics::incr(&metrics.connections_accepted);

                let f = factory.clone();
                let r = running.clone();
                thread::spawn(move || {
                    let _slot = slot;
                    Connection::handle(stream, peer_addr, f, r);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Counts an open connection until dropped.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self {
            active: active.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A single camera connection with its own pipeline.
struct Connection {
    stream: TcpStream,
    handle: ConnectionHandle,
    pipeline: Pipeline,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Connection {
    /// Entry point: set up a connection and run its read loop.
    pub fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        factory: Arc<SessionFactory>,
        running: Arc<AtomicBool>,
    ) {
        let handle = match ConnectionHandle::new(&stream) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "failed to set up connection");
                return;
            }
        };
        if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL)) {
            tracing::warn!(%peer_addr, error = %e, "failed to set read timeout");
            return;
        }

        tracing::info!(%peer_addr, "camera connected");

        let mut conn = Connection {
            pipeline: Pipeline::new(factory.clone(), Some(handle.clone())),
            stream,
            handle,
            peer_addr,
            idle_timeout: factory.config().idle_timeout(),
            metrics: factory.metrics(),
        };

        let reason = conn.run(&running);
        conn.pipeline.close();

        tracing::info!(%peer_addr, reason, "camera disconnected");
    }

    /// Read loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut last_read = Instant::now();

        while running.load(Ordering::SeqCst) {
            match self.stream.read(&mut buf) {
                Ok(0) if self.handle.is_closed() => return "recording stopped",
                Ok(0) => return "connection closed by client",
                Ok(n) => {
                    last_read = Instant::now();
                    tracing::trace!(
                        peer = %self.peer_addr,
                        len = n,
                        stage = self.pipeline.stage(),
                        "read"
                    );
                    if let Err(e) = self.pipeline.on_bytes(&buf[..n]) {
                        tracing::warn!(
                            peer = %self.peer_addr,
                            stage = self.pipeline.stage(),
                            error = %e,
                            "pipeline error"
                        );
                        self.pipeline.abort("pipeline error");
                        return "pipeline error";
                    }
                }
                Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if last_read.elapsed() >= self.idle_timeout {
                        metrics::incr(&self.metrics.idle_timeouts);
                        self.pipeline.abort("idle timeout");
                        return "idle timeout";
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.handle.is_closed() {
                        return "recording stopped";
                    }
                    tracing::warn!(peer = %self.peer_addr, error = %e, "read error");
                    self.pipeline.abort("read error");
                    return "read error";
                }
            }
        }

        "server shutting down"
    }
}
