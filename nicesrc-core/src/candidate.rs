//! Candidates as reported by the agent, and lookup by foundation.

use std::fmt;

use crate::address::TransportAddress;

/// Component id conventionally used for RTP.
pub const COMPONENT_RTP: u32 = 1;
/// Component id conventionally used for RTCP.
pub const COMPONENT_RTCP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        };
        f.write_str(s)
    }
}

/// One local or remote candidate of a stream/component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub stream_id: u32,
    pub component_id: u32,
    pub candidate_type: CandidateType,
    pub priority: u32,
    pub addr: TransportAddress,
}

impl Candidate {
    /// Host UDP candidate with zero priority. Enough for address lookups.
    pub fn host(
        foundation: impl Into<String>,
        stream_id: u32,
        component_id: u32,
        addr: TransportAddress,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            stream_id,
            component_id,
            candidate_type: CandidateType::Host,
            priority: 0,
            addr,
        }
    }
}

/// First candidate whose foundation equals `foundation`. Linear scan; lists are short.
pub fn find_by_foundation<'a>(candidates: &'a [Candidate], foundation: &str) -> Option<&'a Candidate> {
    candidates.iter().find(|c| c.foundation == foundation)
}
