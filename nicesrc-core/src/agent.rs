//! The ICE agent as seen by the source: receive attachment, candidate lookup,
//! and the "new selected pair" notification.
//!
//! The connectivity algorithm itself lives in the agent implementation. The source
//! only needs the operations of the [`Agent`] trait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::candidate::Candidate;
use crate::rendezvous::Rendezvous;

/// Notification that the agent picked a candidate pair for a stream/component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPair {
    pub stream_id: u32,
    pub component_id: u32,
    pub local_foundation: String,
    pub remote_foundation: String,
}

/// Callback registered for selected-pair notifications.
pub type SelectedPairHandler = Arc<dyn Fn(&SelectedPair) + Send + Sync>;

/// Handle returned by [`Agent::connect_selected_pair`]. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("unknown stream {stream_id} / component {component_id}")]
    UnknownComponent { stream_id: u32, component_id: u32 },
    #[error("receive already attached for stream {stream_id} / component {component_id}")]
    AlreadyAttached { stream_id: u32, component_id: u32 },
    #[error("agent rejected attach: {0}")]
    Rejected(String),
}

/// Operations the source needs from an ICE agent.
pub trait Agent: Send + Sync {
    /// Route datagrams received on `stream_id`/`component_id` into `sink`.
    /// Replaces any sink previously attached for the same pair.
    fn attach_recv(&self, stream_id: u32, component_id: u32, sink: RecvSink)
        -> Result<(), AgentError>;

    /// Stop delivering to the sink attached for `stream_id`/`component_id`.
    /// After this returns, the agent must not call the old sink again.
    fn detach_recv(&self, stream_id: u32, component_id: u32);

    fn local_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate>;

    fn remote_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate>;

    fn connect_selected_pair(&self, handler: SelectedPairHandler) -> SubscriptionId;

    fn disconnect_selected_pair(&self, id: SubscriptionId);
}

/// Receiving end handed to [`Agent::attach_recv`]. Cheap to clone.
///
/// Delivered bytes are copied onto the source's loop. They are dispatched by the next
/// (or current) pull. A sink whose source is gone silently drops deliveries.
#[derive(Clone)]
pub struct RecvSink {
    target: Weak<Rendezvous>,
}

impl RecvSink {
    pub(crate) fn new(target: Weak<Rendezvous>) -> Self {
        Self { target }
    }

    /// Deliver one datagram. Returns false if the source no longer exists.
    pub fn deliver(&self, stream_id: u32, component_id: u32, payload: &[u8]) -> bool {
        match self.target.upgrade() {
            Some(rendezvous) => {
                rendezvous.post_datagram(stream_id, component_id, payload);
                true
            }
            None => {
                trace!(stream_id, component_id, len = payload.len(), "source gone, dropping datagram");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl std::fmt::Debug for RecvSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Handler registry for the selected-pair notification. Agent implementations embed one.
pub struct SelectedPairSignal {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<SubscriptionId, SelectedPairHandler>>,
}

impl SelectedPairSignal {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn connect(&self, handler: SelectedPairHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().insert(id, handler);
        id
    }

    /// Returns false if `id` was not connected.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Invoke every handler in connection order. Handlers run without the registry
    /// lock held, so they may connect or disconnect.
    pub fn emit(&self, pair: &SelectedPair) {
        let handlers: Vec<SelectedPairHandler> = self.handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(pair);
        }
    }
}

impl Default for SelectedPairSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pair(stream_id: u32) -> SelectedPair {
        SelectedPair {
            stream_id,
            component_id: 1,
            local_foundation: "1".into(),
            remote_foundation: "2".into(),
        }
    }

    #[test]
    fn ids_are_nonzero_and_distinct() {
        let signal = SelectedPairSignal::new();
        let a = signal.connect(Arc::new(|_| {}));
        let b = signal.connect(Arc::new(|_| {}));
        assert_ne!(a.as_u64(), 0);
        assert_ne!(a, b);
        assert_eq!(signal.handler_count(), 2);
    }

    #[test]
    fn emit_reaches_connected_handlers_only() {
        let signal = SelectedPairSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = signal.connect(Arc::new(move |p: &SelectedPair| {
            assert_eq!(p.stream_id, 4);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        signal.emit(&pair(4));
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&pair(4));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_disconnect_itself() {
        let signal = Arc::new(SelectedPairSignal::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (s, sl) = (signal.clone(), slot.clone());
        let id = signal.connect(Arc::new(move |_: &SelectedPair| {
            if let Some(id) = sl.lock().take() {
                s.disconnect(id);
            }
        }));
        *slot.lock() = Some(id);
        signal.emit(&pair(1));
        assert_eq!(signal.handler_count(), 0);
    }

    #[test]
    fn sink_without_source_drops() {
        let sink = RecvSink::new(Weak::new());
        assert!(!sink.is_connected());
        assert!(!sink.deliver(1, 1, b"lost"));
    }
}
