//! Output buffers handed to the pipeline.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Negotiated caps, opaque to this crate (e.g. `application/x-rtp`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caps(Arc<str>);

impl Caps {
    pub fn new(description: &str) -> Self {
        Caps(Arc::from(description))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One received datagram plus network metadata.
/// `from` is the remote end of the selected pair, `to` the local end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetBuffer {
    pub data: Vec<u8>,
    pub offset: u64,
    pub from: Option<SocketAddr>,
    pub to: Option<SocketAddr>,
    pub caps: Option<Caps>,
    /// Presentation timestamp, running time since activation.
    pub pts: Option<Duration>,
}

impl NetBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            offset: 0,
            from: None,
            to: None,
            caps: None,
            pts: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
