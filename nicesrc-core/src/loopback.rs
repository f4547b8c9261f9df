//! In-process agent: candidates are set by hand, datagrams and pair selections are
//! injected by the caller. Used for embedding without a network stack and in tests.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::agent::{
    Agent, AgentError, RecvSink, SelectedPair, SelectedPairHandler, SelectedPairSignal,
    SubscriptionId,
};
use crate::candidate::Candidate;

#[derive(Default)]
struct Inner {
    sinks: HashMap<(u32, u32), RecvSink>,
    locals: Vec<Candidate>,
    remotes: Vec<Candidate>,
    attach_calls: usize,
    reject_attach: bool,
}

#[derive(Default)]
pub struct LoopbackAgent {
    inner: Mutex<Inner>,
    selected_pair: SelectedPairSignal,
}

impl LoopbackAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local_candidate(&self, candidate: Candidate) {
        self.inner.lock().locals.push(candidate);
    }

    pub fn add_remote_candidate(&self, candidate: Candidate) {
        self.inner.lock().remotes.push(candidate);
    }

    /// Make every later `attach_recv` fail.
    pub fn set_reject_attach(&self, reject: bool) {
        self.inner.lock().reject_attach = reject;
    }

    /// Push a datagram to the sink attached for the pair.
    /// Returns false if nothing is attached or the source is gone.
    pub fn deliver(&self, stream_id: u32, component_id: u32, payload: &[u8]) -> bool {
        let sink = self.inner.lock().sinks.get(&(stream_id, component_id)).cloned();
        match sink {
            Some(sink) => sink.deliver(stream_id, component_id, payload),
            None => false,
        }
    }

    /// Announce a selected pair to every connected handler.
    pub fn select_pair(
        &self,
        stream_id: u32,
        component_id: u32,
        local_foundation: &str,
        remote_foundation: &str,
    ) {
        self.selected_pair.emit(&SelectedPair {
            stream_id,
            component_id,
            local_foundation: local_foundation.to_string(),
            remote_foundation: remote_foundation.to_string(),
        });
    }

    pub fn is_attached(&self, stream_id: u32, component_id: u32) -> bool {
        self.inner.lock().sinks.contains_key(&(stream_id, component_id))
    }

    /// Number of `attach_recv` calls so far, failed ones included.
    pub fn attach_calls(&self) -> usize {
        self.inner.lock().attach_calls
    }

    pub fn selected_pair_handlers(&self) -> usize {
        self.selected_pair.handler_count()
    }
}

fn matching(list: &[Candidate], stream_id: u32, component_id: u32) -> Vec<Candidate> {
    list.iter()
        .filter(|c| c.stream_id == stream_id && c.component_id == component_id)
        .cloned()
        .collect()
}

impl Agent for LoopbackAgent {
    fn attach_recv(
        &self,
        stream_id: u32,
        component_id: u32,
        sink: RecvSink,
    ) -> Result<(), AgentError> {
        let mut inner = self.inner.lock();
        inner.attach_calls += 1;
        if inner.reject_attach {
            return Err(AgentError::Rejected("loopback agent set to reject".into()));
        }
        inner.sinks.insert((stream_id, component_id), sink);
        debug!(stream_id, component_id, "loopback: receive attached");
        Ok(())
    }

    fn detach_recv(&self, stream_id: u32, component_id: u32) {
        if self.inner.lock().sinks.remove(&(stream_id, component_id)).is_some() {
            debug!(stream_id, component_id, "loopback: receive detached");
        }
    }

    fn local_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate> {
        matching(&self.inner.lock().locals, stream_id, component_id)
    }

    fn remote_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate> {
        matching(&self.inner.lock().remotes, stream_id, component_id)
    }

    fn connect_selected_pair(&self, handler: SelectedPairHandler) -> SubscriptionId {
        self.selected_pair.connect(handler)
    }

    fn disconnect_selected_pair(&self, id: SubscriptionId) {
        self.selected_pair.disconnect(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::TransportAddress;
    use crate::rendezvous::Rendezvous;
    use std::sync::Arc;
    use uuid::Uuid;

    fn addr(port: u16) -> TransportAddress {
        TransportAddress::Ipv4 {
            ip: [127, 0, 0, 1],
            port,
        }
    }

    #[test]
    fn candidates_filtered_by_component() {
        let agent = LoopbackAgent::new();
        agent.add_local_candidate(Candidate::host("1", 1, 1, addr(1)));
        agent.add_local_candidate(Candidate::host("2", 1, 2, addr(2)));
        agent.add_remote_candidate(Candidate::host("3", 2, 1, addr(3)));
        assert_eq!(agent.local_candidates(1, 1).len(), 1);
        assert_eq!(agent.local_candidates(1, 2)[0].foundation, "2");
        assert!(agent.remote_candidates(1, 1).is_empty());
        assert_eq!(agent.remote_candidates(2, 1).len(), 1);
    }

    #[test]
    fn deliver_routes_to_attached_sink() {
        let agent = LoopbackAgent::new();
        let rdv = Arc::new(Rendezvous::new(Uuid::new_v4()));
        assert!(!agent.deliver(1, 1, b"nobody"));
        agent
            .attach_recv(1, 1, RecvSink::new(Arc::downgrade(&rdv)))
            .unwrap();
        assert!(agent.is_attached(1, 1));
        assert!(agent.deliver(1, 1, b"data"));
        assert!(!agent.deliver(1, 2, b"wrong component"));
        assert_eq!(rdv.pending_datagrams(), 1);

        agent.detach_recv(1, 1);
        assert!(!agent.is_attached(1, 1));
        assert!(!agent.deliver(1, 1, b"late"));
    }

    #[test]
    fn rejecting_agent_counts_attempts() {
        let agent = LoopbackAgent::new();
        agent.set_reject_attach(true);
        let result = agent.attach_recv(1, 1, RecvSink::new(std::sync::Weak::new()));
        assert!(matches!(result, Err(AgentError::Rejected(_))));
        assert_eq!(agent.attach_calls(), 1);
        assert!(!agent.is_attached(1, 1));
    }
}
