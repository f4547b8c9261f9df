//! Pull/interrupt rendezvous: turns the agent's push-style receive callback into a
//! blocking "give me one buffer or tell me you were interrupted" call.
//!
//! One [`Rendezvous`] belongs to one source. All of its state sits behind a single lock,
//! and one condition variable wakes the puller:
//!
//! - datagrams posted by the agent are queued and dispatched only while a pull waits;
//! - `unlock()` requests a stop (effective only while a pull waits) and arms a one-shot
//!   wakeup that the loop consumes before anything else, so an unlock that lands before
//!   the pull starts waiting is still observed;
//! - `unlock_stop()` clears the unlocked flag and cancels a wakeup that has not fired.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::buffer::{Caps, NetBuffer};

/// Datagrams held for a pull that has not come yet. The oldest is dropped past this.
pub const MAX_PENDING_DATAGRAMS: usize = 256;

/// Where the rendezvous is in the current (or last) pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No pull running; last pull (if any) produced a buffer.
    Idle,
    /// A pull is blocked in the loop.
    Waiting,
    /// The last pull was stopped without a buffer.
    Interrupted,
}

/// Registration of the one-shot wakeup armed by `unlock()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// Pull interrupted by `unlock()`, or called while unlocked.
    #[error("wrong state: source is unlocked")]
    WrongState,
}

struct Datagram {
    stream_id: u32,
    component_id: u32,
    payload: Vec<u8>,
}

struct State {
    phase: Phase,
    unlocked: bool,
    quit_requested: bool,
    wakeup: Option<WakeupId>,
    next_wakeup: u64,
    pending: VecDeque<Datagram>,
    outbuf: Option<NetBuffer>,
    from: Option<SocketAddr>,
    to: Option<SocketAddr>,
    caps: Option<Caps>,
    timestamp_base: Option<Instant>,
}

impl State {
    /// Receive callback, run on the pulling thread: wrap the datagram, attach the
    /// cached addresses, and park it as the pull result.
    fn on_datagram(&mut self, datagram: Datagram, length: u32) {
        let Datagram {
            stream_id,
            component_id,
            payload,
        } = datagram;
        if payload.len() > length as usize {
            trace!(
                stream_id,
                component_id,
                len = payload.len(),
                length,
                "datagram larger than requested length"
            );
        }
        let mut buf = NetBuffer::new(payload);
        buf.from = self.from;
        buf.to = self.to;
        buf.caps = self.caps.clone();
        buf.pts = self.timestamp_base.map(|base| base.elapsed());
        self.outbuf = Some(buf);
    }
}

pub struct Rendezvous {
    source_id: Uuid,
    state: Mutex<State>,
    wake: Condvar,
}

impl Rendezvous {
    pub fn new(source_id: Uuid) -> Self {
        Self {
            source_id,
            state: Mutex::new(State {
                phase: Phase::Idle,
                unlocked: false,
                quit_requested: false,
                wakeup: None,
                next_wakeup: 1,
                pending: VecDeque::new(),
                outbuf: None,
                from: None,
                to: None,
                caps: None,
                timestamp_base: None,
            }),
            wake: Condvar::new(),
        }
    }

    /// Block until a datagram is dispatched or an unlock stops the loop.
    /// `length` is advisory: datagrams are never split.
    pub fn pull(&self, offset: u64, length: u32) -> Result<NetBuffer, FlowError> {
        let mut state = self.state.lock();
        trace!(source = %self.source_id, offset, length, "pull");
        if state.unlocked {
            debug!(source = %self.source_id, "pull while unlocked");
            return Err(FlowError::WrongState);
        }

        state.outbuf = None;
        // A stop requested while no loop was running is lost, like quitting an idle loop.
        state.quit_requested = false;
        state.phase = Phase::Waiting;

        loop {
            if let Some(id) = state.wakeup.take() {
                trace!(source = %self.source_id, wakeup = id.0, "unlock wakeup fired");
                break;
            }
            if state.quit_requested {
                state.quit_requested = false;
                break;
            }
            if let Some(datagram) = state.pending.pop_front() {
                state.on_datagram(datagram, length);
                break;
            }
            self.wake.wait(&mut state);
        }

        match state.outbuf.take() {
            Some(mut buf) => {
                state.phase = Phase::Idle;
                buf.offset = offset;
                trace!(source = %self.source_id, len = buf.len(), "got buffer");
                Ok(buf)
            }
            None => {
                state.phase = Phase::Interrupted;
                debug!(source = %self.source_id, "interrupted, returning wrong-state");
                Err(FlowError::WrongState)
            }
        }
    }

    /// Interrupt a blocked pull and make later pulls fail until `unlock_stop()`.
    pub fn unlock(&self) -> bool {
        let mut state = self.state.lock();
        state.unlocked = true;
        if state.phase == Phase::Waiting {
            state.quit_requested = true;
        }
        let id = WakeupId(state.next_wakeup);
        state.next_wakeup += 1;
        state.wakeup = Some(id);
        debug!(source = %self.source_id, wakeup = id.0, "unlock");
        self.wake.notify_all();
        true
    }

    /// Re-arm after `unlock()`: clear the flag and cancel the wakeup if it has not fired.
    pub fn unlock_stop(&self) -> bool {
        let mut state = self.state.lock();
        state.unlocked = false;
        if let Some(id) = state.wakeup.take() {
            trace!(source = %self.source_id, wakeup = id.0, "cancelled pending wakeup");
        }
        debug!(source = %self.source_id, "unlock stop");
        true
    }

    /// Queue a received datagram for the loop. Copies `payload`.
    pub(crate) fn post_datagram(&self, stream_id: u32, component_id: u32, payload: &[u8]) {
        let mut state = self.state.lock();
        if state.pending.len() >= MAX_PENDING_DATAGRAMS {
            if let Some(old) = state.pending.pop_front() {
                trace!(
                    source = %self.source_id,
                    stream_id = old.stream_id,
                    component_id = old.component_id,
                    len = old.payload.len(),
                    "receive queue full, dropping oldest datagram"
                );
            }
        }
        state.pending.push_back(Datagram {
            stream_id,
            component_id,
            payload: payload.to_vec(),
        });
        self.wake.notify_all();
    }

    /// Replace the cached addresses in one critical section. `None` leaves a side unchanged.
    pub fn cache_addresses(&self, from: Option<SocketAddr>, to: Option<SocketAddr>) {
        let mut state = self.state.lock();
        if let Some(from) = from {
            state.from = Some(from);
        }
        if let Some(to) = to {
            state.to = Some(to);
        }
    }

    /// Cached (from, to) addresses.
    pub fn addresses(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        let state = self.state.lock();
        (state.from, state.to)
    }

    pub fn set_caps(&self, caps: Option<Caps>) {
        self.state.lock().caps = caps;
    }

    pub fn caps(&self) -> Option<Caps> {
        self.state.lock().caps.clone()
    }

    /// Start (`Some`) or stop (`None`) stamping buffers relative to `base`.
    pub fn set_timestamp_base(&self, base: Option<Instant>) {
        self.state.lock().timestamp_base = base;
    }

    /// Drop datagrams that were never pulled. Returns how many were dropped.
    pub fn flush_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    pub fn has_pending_wakeup(&self) -> bool {
        self.state.lock().wakeup.is_some()
    }

    pub fn pending_datagrams(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Rendezvous")
            .field("source_id", &self.source_id)
            .field("phase", &state.phase)
            .field("unlocked", &state.unlocked)
            .field("pending", &state.pending.len())
            .finish()
    }
}
