//! # Channel Multiplexing
//!
//! Short-lived logical streams overlaid on the encrypted connection. A
//! channel is a 16-bit correlation id: requests carry it out, the server
//! addresses fragments back to it, and an empty fragment ends it. The
//! registry is per-session state; ids are reused only after retirement.
//!
//! Inbound fragments are delivered as messages on a bounded queue rather
//! than through callbacks, so consumers decide their own back-pressure
//! and never run on the receive task.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};

/// What a channel was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Ad,
    Image,
    Search,
    AesKey,
    Substream,
    Browse,
    Playlist,
}

/// Messages delivered to a channel consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A payload fragment, in wire order.
    Data(Bytes),
    /// End-of-channel marker; the id has been retired.
    End,
    /// Server-side failure; the id has been retired.
    Error,
}

#[derive(Debug)]
struct ChannelSlot {
    kind: ChannelKind,
    tx: mpsc::Sender<ChannelEvent>,
}

#[derive(Debug)]
struct Inner {
    next_id: u16,
    live: HashMap<u16, ChannelSlot>,
}

/// Per-session registry of live channels.
#[derive(Debug)]
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                live: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a channel of the given kind.
    ///
    /// Ids come from an incrementing counter that skips live ids on
    /// wrap-around. Returns the id together with the consumer side of
    /// the channel's event queue.
    pub fn register(
        &self,
        kind: ChannelKind,
        capacity: usize,
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let mut inner = self.lock();
        if inner.live.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidArgument(
                "no free channel ids".to_string(),
            ));
        }

        let mut id = inner.next_id;
        while inner.live.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let (tx, rx) = mpsc::channel(capacity);
        inner.live.insert(id, ChannelSlot { kind, tx });
        trace!(id, ?kind, "channel registered");
        Ok((id, rx))
    }

    /// Remove a channel. Returns false if the id was not live.
    pub fn retire(&self, id: u16) -> bool {
        let removed = self.lock().live.remove(&id).is_some();
        if removed {
            trace!(id, "channel retired");
        }
        removed
    }

    /// True while the id is registered and not yet retired.
    pub fn is_live(&self, id: u16) -> bool {
        self.lock().live.contains_key(&id)
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the queue handle for a live channel so events can be
    /// sent without holding the registry lock across an await.
    pub(crate) fn sender_for(&self, id: u16) -> Option<(ChannelKind, mpsc::Sender<ChannelEvent>)> {
        self.lock()
            .live
            .get(&id)
            .map(|slot| (slot.kind, slot.tx.clone()))
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
