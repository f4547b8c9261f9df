//! Selected-pair listener: keeps the source's from/to addresses in step with the
//! candidate pair the agent has chosen.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::address::translate_into;
use crate::agent::{Agent, SelectedPair, SelectedPairHandler};
use crate::candidate::find_by_foundation;
use crate::rendezvous::Rendezvous;

/// Reacts to selected-pair notifications for one stream/component.
///
/// Holds the agent and the rendezvous weakly: the handler lives inside the agent.
pub struct SelectedPairListener {
    stream_id: u32,
    component_id: u32,
    agent: Weak<dyn Agent>,
    rendezvous: Weak<Rendezvous>,
}

impl SelectedPairListener {
    pub fn new(
        stream_id: u32,
        component_id: u32,
        agent: &Arc<dyn Agent>,
        rendezvous: &Arc<Rendezvous>,
    ) -> Self {
        Self {
            stream_id,
            component_id,
            agent: Arc::downgrade(agent),
            rendezvous: Arc::downgrade(rendezvous),
        }
    }

    pub fn into_handler(self) -> SelectedPairHandler {
        Arc::new(move |pair: &SelectedPair| self.on_new_selected_pair(pair))
    }

    pub fn on_new_selected_pair(&self, pair: &SelectedPair) {
        if pair.stream_id != self.stream_id || pair.component_id != self.component_id {
            trace!(
                stream_id = pair.stream_id,
                component_id = pair.component_id,
                "selected pair for another component"
            );
            return;
        }
        let (Some(agent), Some(rendezvous)) = (self.agent.upgrade(), self.rendezvous.upgrade())
        else {
            return;
        };

        let locals = agent.local_candidates(pair.stream_id, pair.component_id);
        let remotes = agent.remote_candidates(pair.stream_id, pair.component_id);

        let mut to = None;
        if let Some(cand) = find_by_foundation(&locals, &pair.local_foundation) {
            translate_into(&cand.addr, &mut to);
        }
        let mut from = None;
        if let Some(cand) = find_by_foundation(&remotes, &pair.remote_foundation) {
            translate_into(&cand.addr, &mut from);
        }

        debug!(
            stream_id = pair.stream_id,
            component_id = pair.component_id,
            local = %pair.local_foundation,
            remote = %pair.remote_foundation,
            ?from,
            ?to,
            "new selected pair"
        );
        rendezvous.cache_addresses(from, to);
    }
}
