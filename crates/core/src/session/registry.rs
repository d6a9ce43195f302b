use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Debug)]
struct HandleInner {
    peer_addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    closed: AtomicBool,
}

/// Shared reference to a live push connection.
///
/// Closing the handle shuts the socket down, which unblocks the
/// connection's reader thread and tears down its pipeline.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(HandleInner {
                peer_addr: stream.peer_addr().ok(),
                stream: Some(stream.try_clone()?),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// A handle with no socket behind it.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                peer_addr: None,
                stream: None,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Force the connection closed. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = &self.inner.stream
            && let Err(e) = stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(peer = ?self.inner.peer_addr, error = %e, "socket shutdown failed");
        }
        tracing::debug!(peer = ?self.inner.peer_addr, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-wide map of recording id to owning connection.
///
/// Only used for out-of-band stop requests and cleanup; the sessions
/// themselves live on their connection threads.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, recording_id: Uuid, handle: ConnectionHandle) {
        let previous = self.sessions.write().insert(recording_id, handle);
        if previous.is_some() {
            tracing::warn!(%recording_id, "replaced existing session registration");
        }
        tracing::debug!(%recording_id, total_sessions = self.len(), "session registered");
    }

    /// Register `handle` unless `recording_id` is already taken.
    ///
    /// Returns `false` and leaves the existing entry in place on conflict.
    pub fn try_put(&self, recording_id: Uuid, handle: ConnectionHandle) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&recording_id) {
            tracing::warn!(%recording_id, "recording id already registered");
            return false;
        }
        sessions.insert(recording_id, handle);
        let total_sessions = sessions.len();
        drop(sessions);
        tracing::debug!(%recording_id, total_sessions, "session registered");
        true
    }

    pub fn remove(&self, recording_id: &Uuid) -> Option<ConnectionHandle> {
        let removed = self.sessions.write().remove(recording_id);
        if removed.is_some() {
            tracing::debug!(%recording_id, total_sessions = self.len(), "session unregistered");
        }
        removed
    }

    /// Remove the entry only if it still belongs to `handle`.
    pub fn remove_owned(&self, recording_id: &Uuid, handle: &ConnectionHandle) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(recording_id) {
            Some(current) if current.same_connection(handle) => {
                sessions.remove(recording_id);
                let total_sessions = sessions.len();
                drop(sessions);
                tracing::debug!(%recording_id, total_sessions, "session unregistered");
                true
            }
            Some(_) => {
                tracing::debug!(%recording_id, "registration owned by another connection");
                false
            }
            None => false,
        }
    }

    pub fn get(&self, recording_id: &Uuid) -> Option<ConnectionHandle> {
        self.sessions.read().get(recording_id).cloned()
    }

    pub fn contains(&self, recording_id: &Uuid) -> bool {
        self.sessions.read().contains_key(recording_id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close the connection recording `recording_id`.
    ///
    /// Returns `false` if no such session is registered. The entry is
    /// removed by the session itself as its connection tears down.
    pub fn stop(&self, recording_id: &Uuid) -> bool {
        match self.get(recording_id) {
            Some(handle) => {
                tracing::info!(%recording_id, "stopping recording");
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close every registered connection.
    pub fn stop_all(&self) -> usize {
        let handles: Vec<ConnectionHandle> = self.sessions.read().values().cloned().collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}
