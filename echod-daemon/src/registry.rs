use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use echod_core::ConnectionId;

/// Bytes moved on one connection, updated by its worker as data flows.
#[derive(Debug, Default)]
pub struct ByteCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ByteCounters {
    pub fn add_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub age: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct Entry {
    remote: SocketAddr,
    connected_at: DateTime<Utc>,
    started: Instant,
    counters: Weak<ByteCounters>,
}

/// Live connections, keyed by id. Entries exist exactly while a worker owns the socket.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<ConnectionId, Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, remote: SocketAddr) -> Arc<ByteCounters> {
        let counters = Arc::new(ByteCounters::default());
        let entry = Entry {
            remote,
            connected_at: Utc::now(),
            started: Instant::now(),
            counters: Arc::downgrade(&counters),
        };
        self.lock().insert(id, entry);
        counters
    }

    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Point-in-time view, ordered by connection id.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshot: Vec<ConnectionSnapshot> = self
            .lock()
            .iter()
            .map(|(id, entry)| {
                let (bytes_in, bytes_out) = entry
                    .counters
                    .upgrade()
                    .map(|c| (c.bytes_in(), c.bytes_out()))
                    .unwrap_or((0, 0));
                ConnectionSnapshot {
                    id: *id,
                    remote: entry.remote,
                    connected_at: entry.connected_at,
                    age: entry.started.elapsed(),
                    bytes_in,
                    bytes_out,
                }
            })
            .collect();
        snapshot.sort_by_key(|s| s.id);
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
