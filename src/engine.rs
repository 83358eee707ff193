//! Per-engine ACK multiplexer.
//!
//! HAProxy may open several connections that all belong to the same
//! "engine" (same `engine-id`, same negotiated frame size) when the async
//! capability is in play; a NOTIFY handled by a worker spawned from one
//! connection can then have its ACK written back out on *any* connection
//! sharing that engine. Connections that did not negotiate `async` get an
//! engine key unique to themselves, so they never share one.
//!
//! Go's channels allow many goroutines to receive from the same channel
//! concurrently; a single [`tokio::sync::mpsc::Receiver`] can't be shared
//! that way, so the receiving half lives behind a `tokio::sync::Mutex`
//! that every connection's reply-writer task locks around each `recv`.
//!
//! The channel itself is built with capacity 1, not unbounded: the
//! original's `acks` channel is a genuinely unbuffered Go channel, so a
//! worker posting an ACK blocks until the shared reply-writer is ready to
//! take it. Tokio's `mpsc` has no true zero-capacity channel, so `1` is the
//! closest approximation — a sender still blocks once that one slot is
//! occupied, which is what gives the fan-in channel its backpressure.

use crate::frame::Frame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Identifies a set of connections whose ACKs are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub frame_size: u32,
    pub engine_id: String,
    /// `Some(id)` for connections without the `async` capability — an
    /// opaque per-connection id assigned by `Agent`, since a socket itself
    /// isn't `Hash`/`Eq`. `None` when `async` is negotiated, allowing
    /// connections to share an engine.
    pub conn_id: Option<u64>,
}

/// A live engine: the channel ACKs are posted to, shared by every
/// connection's reply-writer task, plus a refcount of joined connections.
pub struct EngineEntry {
    pub acks_tx: mpsc::Sender<Frame>,
    pub acks_rx: AsyncMutex<mpsc::Receiver<Frame>>,
    count: StdMutex<usize>,
}

/// The process-wide table of live engines.
#[derive(Default)]
pub struct Registry {
    engines: StdMutex<HashMap<EngineKey, Arc<EngineEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            engines: StdMutex::new(HashMap::new()),
        }
    }

    /// Join `key`'s engine, creating it if this is the first connection.
    /// Returns the shared entry; the caller must call [`Registry::leave`]
    /// exactly once when its connection ends.
    pub fn join(&self, key: EngineKey) -> Arc<EngineEntry> {
        let mut engines = self.engines.lock().expect("engine registry mutex poisoned");
        if let Some(entry) = engines.get(&key) {
            *entry.count.lock().expect("engine entry mutex poisoned") += 1;
            return Arc::clone(entry);
        }

        let (tx, rx) = mpsc::channel(1);
        let entry = Arc::new(EngineEntry {
            acks_tx: tx,
            acks_rx: AsyncMutex::new(rx),
            count: StdMutex::new(1),
        });
        engines.insert(key, Arc::clone(&entry));
        entry
    }

    /// Leave `key`'s engine, removing it from the registry once its
    /// refcount drops to zero.
    pub fn leave(&self, key: &EngineKey) {
        let mut engines = self.engines.lock().expect("engine registry mutex poisoned");
        if let Some(entry) = engines.get(key) {
            let mut count = entry.count.lock().expect("engine entry mutex poisoned");
            *count -= 1;
            if *count == 0 {
                drop(count);
                engines.remove(key);
            }
        }
    }

    /// Number of distinct engines currently tracked.
    pub fn len(&self) -> usize {
        self.engines.lock().expect("engine registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
