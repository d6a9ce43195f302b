use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::events::{EventPublisher, TracingPublisher};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::session::SessionRegistry;
use crate::session::factory::SessionFactory;
use crate::storage::{PlaceDirectory, VideoStorage};
use crate::transport::tcp;

/// Server-level configuration shared by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the push listener binds to.
    pub bind_addr: String,
    /// HMAC key for session tokens.
    pub secret: Vec<u8>,
    /// Maximum age of a recording id presented in a token.
    pub session_timeout_secs: u64,
    /// A connection that sends nothing for this long is torn down.
    pub idle_timeout_secs: u64,
    /// Upper bound on the handshake header block.
    pub max_header_size: usize,
    /// Stream time between forced flushes of the output.
    pub flush_interval_secs: u64,
    /// Connections beyond this are refused at accept time.
    pub max_connections: usize,
    /// Retention of live-stream sessions; recordings are kept.
    pub stream_ttl_secs: Option<u64>,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stream_ttl(&self) -> Option<Duration> {
        self.stream_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            secret: Vec::new(),
            session_timeout_secs: 60,
            idle_timeout_secs: 30,
            max_header_size: 8192,
            flush_interval_secs: 5,
            max_connections: 1024,
            stream_ttl_secs: None,
        }
    }
}

/// Push-RTSP recording server.
///
/// Accepts camera connections on a background thread and runs one
/// ingestion pipeline per connection on its own thread. Delegates
/// connection handling to [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    factory: Arc<SessionFactory>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Create a server that logs its recording events.
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn VideoStorage>,
        places: Arc<dyn PlaceDirectory>,
    ) -> Self {
        Self::with_events(config, storage, places, Arc::new(TracingPublisher))
    }

    pub fn with_events(
        config: ServerConfig,
        storage: Arc<dyn VideoStorage>,
        places: Arc<dyn PlaceDirectory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        if config.secret.is_empty() {
            tracing::warn!("token secret is empty");
        }
        let factory = SessionFactory::new(
            Arc::new(config),
            storage,
            places,
            events,
            SessionRegistry::new(),
            Arc::new(Metrics::default()),
        );
        Self {
            factory: Arc::new(factory),
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
            accept_thread: None,
        }
    }

    /// Bind the listener and start accepting connections.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RecorderError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.factory.config().bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        self.local_addr = Some(local_addr);

        let factory = self.factory.clone();
        let running = self.running.clone();
        let active = self.active.clone();

        tracing::info!(addr = %local_addr, "push server listening");

        self.accept_thread = Some(thread::spawn(move || {
            tcp::accept_loop(listener, factory, running, active);
        }));

        Ok(local_addr)
    }

    /// Stop accepting and close every live recording.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");

        let closed = self.factory.registry().stop_all();
        if let Some(thread) = self.accept_thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("accept thread panicked");
        }
        tracing::info!(closed, metrics = ?self.metrics(), "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(RecorderError::NotStarted)
    }

    /// Force-close the connection recording `recording_id`.
    ///
    /// The session completes as its connection tears down. Returns `false`
    /// if no such recording is live.
    pub fn stop_recording(&self, recording_id: &Uuid) -> bool {
        self.factory.registry().stop(recording_id)
    }

    /// Ids of the live recordings.
    pub fn recordings(&self) -> Vec<Uuid> {
        self.factory.registry().ids()
    }

    /// Number of open connections, authenticated or not.
    pub fn connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.factory.registry()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.factory.metrics().snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        self.factory.config()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
