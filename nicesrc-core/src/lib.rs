//! ICE source: exposes an ICE agent's receive stream as a pull-based pipeline source.
//! Host-driven: the agent pushes datagrams, the pipeline pulls buffers and may
//! interrupt a blocked pull from any thread.

pub mod address;
pub mod agent;
pub mod buffer;
pub mod candidate;
pub mod config;
pub mod loopback;
pub mod pair;
pub mod rendezvous;
pub mod source;

pub use address::TransportAddress;
pub use agent::{
    Agent, AgentError, RecvSink, SelectedPair, SelectedPairHandler, SelectedPairSignal,
    SubscriptionId,
};
pub use buffer::{Caps, NetBuffer};
pub use candidate::{Candidate, CandidateType};
pub use config::{ConfigError, SourceConfig};
pub use loopback::LoopbackAgent;
pub use rendezvous::{FlowError, Phase};
pub use source::{
    ElementState, NiceSrc, PropertyError, PropertyValue, StateChange, StateChangeError,
};

pub mod ffi;
