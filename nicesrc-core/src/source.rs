//! `NiceSrc`: the pipeline-facing source element.
//!
//! Host-driven: the pipeline sets properties, walks the element through its states and
//! calls [`NiceSrc::pull`] from its streaming thread. [`NiceSrc::unlock`] and
//! [`NiceSrc::unlock_stop`] may come from any thread.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentError, RecvSink, SubscriptionId};
use crate::buffer::{Caps, NetBuffer};
use crate::pair::SelectedPairListener;
use crate::rendezvous::{FlowError, Phase, Rendezvous};

/// Static element description.
pub struct ElementMetadata {
    pub long_name: &'static str,
    pub classification: &'static str,
    pub description: &'static str,
}

pub const METADATA: ElementMetadata = ElementMetadata {
    long_name: "ICE source",
    classification: "Source",
    description: "Interactive UDP connectivity establishment",
};

/// The single always-present pad.
pub const SRC_PAD_NAME: &str = "src";
pub const SRC_PAD_CAPS: &str = "ANY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    pub fn current(&self) -> ElementState {
        match self {
            StateChange::NullToReady => ElementState::Null,
            StateChange::ReadyToPaused | StateChange::ReadyToNull => ElementState::Ready,
            StateChange::PausedToPlaying | StateChange::PausedToReady => ElementState::Paused,
            StateChange::PlayingToPaused => ElementState::Playing,
        }
    }

    pub fn next(&self) -> ElementState {
        match self {
            StateChange::NullToReady | StateChange::PausedToReady => ElementState::Ready,
            StateChange::ReadyToPaused | StateChange::PlayingToPaused => ElementState::Paused,
            StateChange::PausedToPlaying => ElementState::Playing,
            StateChange::ReadyToNull => ElementState::Null,
        }
    }

    /// Single step from `from` towards `target`, or `None` if already there.
    pub fn step(from: ElementState, target: ElementState) -> Option<StateChange> {
        use ElementState::*;
        let rank = |s: ElementState| match s {
            Null => 0,
            Ready => 1,
            Paused => 2,
            Playing => 3,
        };
        if rank(target) > rank(from) {
            Some(match from {
                Null => StateChange::NullToReady,
                Ready => StateChange::ReadyToPaused,
                Paused | Playing => StateChange::PausedToPlaying,
            })
        } else if rank(target) < rank(from) {
            Some(match from {
                Playing => StateChange::PlayingToPaused,
                Paused => StateChange::PausedToReady,
                Ready | Null => StateChange::ReadyToNull,
            })
        } else {
            None
        }
    }
}

/// Setting that must be present before the source can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSetting {
    Agent,
    StreamId,
    ComponentId,
}

impl fmt::Display for MissingSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissingSetting::Agent => "an agent",
            MissingSetting::StreamId => "a stream id",
            MissingSetting::ComponentId => "a component id",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateChangeError {
    #[error("cannot start nice source without {0}")]
    Configuration(MissingSetting),
    #[error("transition {transition:?} is invalid from state {current:?}")]
    InvalidTransition {
        transition: StateChange,
        current: ElementState,
    },
    #[error("agent refused receive attach: {0}")]
    Agent(#[from] AgentError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("changing the agent on a nice source is not allowed")]
    AgentAlreadySet,
    #[error("property cannot change in state {0:?}")]
    Active(ElementState),
    #[error("unknown property {0:?}")]
    Unknown(String),
    #[error("property {name:?} expects {expected}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
    },
}

/// Value for the generic property table.
#[derive(Clone)]
pub enum PropertyValue {
    Agent(Option<Arc<dyn Agent>>),
    UInt(u32),
    Bool(bool),
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Agent(a) => write!(f, "Agent(set: {})", a.is_some()),
            PropertyValue::UInt(v) => write!(f, "UInt({})", v),
            PropertyValue::Bool(v) => write!(f, "Bool({})", v),
        }
    }
}

struct Settings {
    agent: Option<Arc<dyn Agent>>,
    stream_id: u32,
    component_id: u32,
    do_timestamp: bool,
    state: ElementState,
    pair_subscription: Option<SubscriptionId>,
}

pub struct NiceSrc {
    id: Uuid,
    settings: Mutex<Settings>,
    rendezvous: Arc<Rendezvous>,
}

impl NiceSrc {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            settings: Mutex::new(Settings {
                agent: None,
                stream_id: 0,
                component_id: 0,
                do_timestamp: true,
                state: ElementState::Null,
                pair_subscription: None,
            }),
            rendezvous: Arc::new(Rendezvous::new(id)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Always true: data arrives at the network's pace.
    pub fn is_live(&self) -> bool {
        true
    }

    pub fn state(&self) -> ElementState {
        self.settings.lock().state
    }

    /// Bind the agent. Only the first agent is kept.
    pub fn set_agent(&self, agent: Arc<dyn Agent>) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        if settings.agent.is_some() {
            error!(source = %self.id, "changing the agent on a nice src not allowed");
            return Err(PropertyError::AgentAlreadySet);
        }
        Self::ensure_inactive(&settings)?;
        settings.agent = Some(agent);
        Ok(())
    }

    pub fn agent(&self) -> Option<Arc<dyn Agent>> {
        self.settings.lock().agent.clone()
    }

    pub fn set_stream_id(&self, stream_id: u32) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        Self::ensure_inactive(&settings)?;
        settings.stream_id = stream_id;
        Ok(())
    }

    pub fn stream_id(&self) -> u32 {
        self.settings.lock().stream_id
    }

    pub fn set_component_id(&self, component_id: u32) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        Self::ensure_inactive(&settings)?;
        settings.component_id = component_id;
        Ok(())
    }

    pub fn component_id(&self) -> u32 {
        self.settings.lock().component_id
    }

    pub fn set_do_timestamp(&self, do_timestamp: bool) -> Result<(), PropertyError> {
        let mut settings = self.settings.lock();
        Self::ensure_inactive(&settings)?;
        settings.do_timestamp = do_timestamp;
        Ok(())
    }

    pub fn do_timestamp(&self) -> bool {
        self.settings.lock().do_timestamp
    }

    /// Negotiated caps to attach to every following buffer.
    pub fn set_caps(&self, caps: Option<Caps>) {
        self.rendezvous.set_caps(caps);
    }

    pub fn caps(&self) -> Option<Caps> {
        self.rendezvous.caps()
    }

    fn ensure_inactive(settings: &Settings) -> Result<(), PropertyError> {
        if settings.state != ElementState::Null {
            warn!(state = ?settings.state, "property change while active ignored");
            return Err(PropertyError::Active(settings.state));
        }
        Ok(())
    }

    /// Generic setter by property name: "agent", "stream", "component", "do-timestamp".
    pub fn set_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError> {
        match (name, value) {
            ("agent", PropertyValue::Agent(Some(agent))) => self.set_agent(agent),
            ("agent", PropertyValue::Agent(None)) => {
                if self.settings.lock().agent.is_some() {
                    error!(source = %self.id, "changing the agent on a nice src not allowed");
                    return Err(PropertyError::AgentAlreadySet);
                }
                Ok(())
            }
            ("agent", _) => Err(PropertyError::TypeMismatch {
                name: "agent",
                expected: "an agent",
            }),
            ("stream", PropertyValue::UInt(v)) => self.set_stream_id(v),
            ("stream", _) => Err(PropertyError::TypeMismatch {
                name: "stream",
                expected: "an unsigned integer",
            }),
            ("component", PropertyValue::UInt(v)) => self.set_component_id(v),
            ("component", _) => Err(PropertyError::TypeMismatch {
                name: "component",
                expected: "an unsigned integer",
            }),
            ("do-timestamp", PropertyValue::Bool(v)) => self.set_do_timestamp(v),
            ("do-timestamp", _) => Err(PropertyError::TypeMismatch {
                name: "do-timestamp",
                expected: "a boolean",
            }),
            (other, _) => {
                warn!(source = %self.id, property = other, "invalid property");
                Err(PropertyError::Unknown(other.to_string()))
            }
        }
    }

    pub fn property(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        let settings = self.settings.lock();
        match name {
            "agent" => Ok(PropertyValue::Agent(settings.agent.clone())),
            "stream" => Ok(PropertyValue::UInt(settings.stream_id)),
            "component" => Ok(PropertyValue::UInt(settings.component_id)),
            "do-timestamp" => Ok(PropertyValue::Bool(settings.do_timestamp)),
            other => {
                warn!(source = %self.id, property = other, "invalid property");
                Err(PropertyError::Unknown(other.to_string()))
            }
        }
    }

    pub fn change_state(&self, transition: StateChange) -> Result<(), StateChangeError> {
        let mut settings = self.settings.lock();
        if transition.current() != settings.state {
            return Err(StateChangeError::InvalidTransition {
                transition,
                current: settings.state,
            });
        }
        match transition {
            StateChange::NullToReady => self.activate(&mut settings)?,
            StateChange::ReadyToNull => self.deactivate(&mut settings),
            _ => {}
        }
        settings.state = transition.next();
        debug!(source = %self.id, ?transition, "state changed");
        Ok(())
    }

    /// Walk single-step transitions until `target`; stops at the first failure.
    pub fn set_state(&self, target: ElementState) -> Result<(), StateChangeError> {
        while let Some(transition) = StateChange::step(self.state(), target) {
            self.change_state(transition)?;
        }
        Ok(())
    }

    fn activate(&self, settings: &mut Settings) -> Result<(), StateChangeError> {
        let Some(agent) = settings.agent.clone() else {
            return Err(self.missing(MissingSetting::Agent));
        };
        if settings.stream_id == 0 {
            return Err(self.missing(MissingSetting::StreamId));
        }
        if settings.component_id == 0 {
            return Err(self.missing(MissingSetting::ComponentId));
        }
        let (stream_id, component_id) = (settings.stream_id, settings.component_id);

        let sink = RecvSink::new(Arc::downgrade(&self.rendezvous));
        if let Err(err) = agent.attach_recv(stream_id, component_id, sink) {
            error!(source = %self.id, stream_id, component_id, %err, "receive attach failed");
            return Err(err.into());
        }

        if settings.pair_subscription.is_none() {
            let listener =
                SelectedPairListener::new(stream_id, component_id, &agent, &self.rendezvous);
            settings.pair_subscription = Some(agent.connect_selected_pair(listener.into_handler()));
        }

        if settings.do_timestamp {
            self.rendezvous.set_timestamp_base(Some(Instant::now()));
        }
        debug!(source = %self.id, stream_id, component_id, "attached to agent");
        Ok(())
    }

    fn missing(&self, what: MissingSetting) -> StateChangeError {
        error!(source = %self.id, "trying to start nice source without {}", what);
        StateChangeError::Configuration(what)
    }

    fn deactivate(&self, settings: &mut Settings) {
        if let Some(agent) = settings.agent.clone() {
            agent.detach_recv(settings.stream_id, settings.component_id);
            if let Some(id) = settings.pair_subscription.take() {
                agent.disconnect_selected_pair(id);
            }
        }
        let dropped = self.rendezvous.flush_pending();
        if dropped > 0 {
            debug!(source = %self.id, dropped, "dropped unpulled datagrams");
        }
        self.rendezvous.set_timestamp_base(None);
    }

    /// Block until one datagram is available, or fail with `WrongState` when unlocked.
    pub fn pull(&self, offset: u64, length: u32) -> Result<NetBuffer, FlowError> {
        self.rendezvous.pull(offset, length)
    }

    pub fn unlock(&self) -> bool {
        self.rendezvous.unlock()
    }

    pub fn unlock_stop(&self) -> bool {
        self.rendezvous.unlock_stop()
    }

    pub fn phase(&self) -> Phase {
        self.rendezvous.phase()
    }

    /// Cached (from, to) addresses of the selected pair.
    pub fn addresses(&self) -> (Option<std::net::SocketAddr>, Option<std::net::SocketAddr>) {
        self.rendezvous.addresses()
    }
}

impl Default for NiceSrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NiceSrc {
    fn drop(&mut self) {
        let settings = self.settings.get_mut();
        if let Some(agent) = settings.agent.take() {
            if settings.state != ElementState::Null {
                agent.detach_recv(settings.stream_id, settings.component_id);
            }
            if let Some(id) = settings.pair_subscription.take() {
                agent.disconnect_selected_pair(id);
            }
        }
    }
}

impl fmt::Debug for NiceSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.settings.lock();
        f.debug_struct("NiceSrc")
            .field("id", &self.id)
            .field("agent", &settings.agent.is_some())
            .field("stream_id", &settings.stream_id)
            .field("component_id", &settings.component_id)
            .field("state", &settings.state)
            .finish()
    }
}
