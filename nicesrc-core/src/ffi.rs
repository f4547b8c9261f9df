//! C ABI for driving the source from C/C++ pipeline hosts (link the staticlib).
//!
//! Two opaque handles: a source (`nicesrc_create`) and an agent adapter
//! (`nicesrc_agent_new`) wrapping the host's agent behind a vtable. The host's agent
//! pushes datagrams with `nicesrc_sink_deliver` and pair changes with
//! `nicesrc_agent_emit_selected_pair`.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::net::SocketAddr;
use std::os::raw::{c_char, c_int};
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::address::{TransportAddress, AF_INET, AF_INET6};
use crate::agent::{
    Agent, AgentError, RecvSink, SelectedPair, SelectedPairHandler, SelectedPairSignal,
    SubscriptionId,
};
use crate::buffer::NetBuffer;
use crate::candidate::Candidate;
use crate::rendezvous::FlowError;
use crate::source::{NiceSrc, PropertyError, StateChange};

pub const NICESRC_OK: c_int = 0;
pub const NICESRC_ERROR: c_int = -1;
/// Pull interrupted by unlock, or source unlocked.
pub const NICESRC_WRONG_STATE: c_int = -2;

pub const NICESRC_NULL_TO_READY: c_int = 0;
pub const NICESRC_READY_TO_PAUSED: c_int = 1;
pub const NICESRC_PAUSED_TO_PLAYING: c_int = 2;
pub const NICESRC_PLAYING_TO_PAUSED: c_int = 3;
pub const NICESRC_PAUSED_TO_READY: c_int = 4;
pub const NICESRC_READY_TO_NULL: c_int = 5;

/// Foundation buffer size, NUL terminator included.
pub const NICESRC_MAX_FOUNDATION: usize = 33;

const INITIAL_CANDIDATE_CAPACITY: usize = 16;

/// Candidate as filled in by the host. `addr` holds 4 (AF_INET) or 16 (AF_INET6) bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NiceSrcCandidate {
    pub foundation: [u8; NICESRC_MAX_FOUNDATION],
    pub family: u16,
    pub port: u16,
    pub addr: [u8; 16],
}

impl NiceSrcCandidate {
    const EMPTY: NiceSrcCandidate = NiceSrcCandidate {
        foundation: [0; NICESRC_MAX_FOUNDATION],
        family: 0,
        port: 0,
        addr: [0; 16],
    };

    fn to_candidate(&self, stream_id: u32, component_id: u32) -> Candidate {
        let end = self
            .foundation
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NICESRC_MAX_FOUNDATION);
        let foundation = String::from_utf8_lossy(&self.foundation[..end]).into_owned();
        let addr = match self.family {
            AF_INET => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&self.addr[..4]);
                TransportAddress::Ipv4 {
                    ip,
                    port: self.port,
                }
            }
            AF_INET6 => TransportAddress::Ipv6 {
                ip: self.addr,
                port: self.port,
            },
            family => TransportAddress::Unsupported { family },
        };
        Candidate::host(foundation, stream_id, component_id, addr)
    }
}

/// Host agent operations. All entries are required.
///
/// - `attach_recv` returns 0 on success. From then on the host calls
///   `nicesrc_sink_deliver(sink, ...)` per datagram; a later attach for the same
///   stream/component replaces the sink.
/// - After `detach_recv` returns, the old sink pointer is freed and must not be used.
/// - `get_candidates` writes up to `cap` entries and returns the total number available
///   (which may exceed `cap`), or a negative value on error. `remote` is 0 or 1.
#[repr(C)]
pub struct NiceSrcAgentVTable {
    pub attach_recv: Option<
        unsafe extern "C" fn(user_data: *mut c_void, stream_id: u32, component_id: u32, sink: *mut c_void) -> c_int,
    >,
    pub detach_recv:
        Option<unsafe extern "C" fn(user_data: *mut c_void, stream_id: u32, component_id: u32)>,
    pub get_candidates: Option<
        unsafe extern "C" fn(
            user_data: *mut c_void,
            stream_id: u32,
            component_id: u32,
            remote: c_int,
            out: *mut NiceSrcCandidate,
            cap: usize,
        ) -> c_int,
    >,
}

type AttachFn =
    unsafe extern "C" fn(*mut c_void, u32, u32, *mut c_void) -> c_int;
type DetachFn = unsafe extern "C" fn(*mut c_void, u32, u32);
type CandidatesFn =
    unsafe extern "C" fn(*mut c_void, u32, u32, c_int, *mut NiceSrcCandidate, usize) -> c_int;

/// Agent backed by host callbacks.
struct HostAgent {
    attach: AttachFn,
    detach: DetachFn,
    candidates: CandidatesFn,
    user_data: *mut c_void,
    sinks: Mutex<HashMap<(u32, u32), *mut RecvSink>>,
    selected_pair: SelectedPairSignal,
}

// The host guarantees its callbacks and user_data may be used from any thread.
unsafe impl Send for HostAgent {}
unsafe impl Sync for HostAgent {}

impl HostAgent {
    fn fetch_candidates(&self, stream_id: u32, component_id: u32, remote: bool) -> Vec<Candidate> {
        let mut cap = INITIAL_CANDIDATE_CAPACITY;
        loop {
            let mut out = vec![NiceSrcCandidate::EMPTY; cap];
            let total = unsafe {
                (self.candidates)(
                    self.user_data,
                    stream_id,
                    component_id,
                    remote as c_int,
                    out.as_mut_ptr(),
                    cap,
                )
            };
            if total < 0 {
                warn!(stream_id, component_id, remote, "host candidate lookup failed");
                return Vec::new();
            }
            let total = total as usize;
            if total > cap {
                cap = total;
                continue;
            }
            return out[..total]
                .iter()
                .map(|c| c.to_candidate(stream_id, component_id))
                .collect();
        }
    }
}

impl Agent for HostAgent {
    fn attach_recv(
        &self,
        stream_id: u32,
        component_id: u32,
        sink: RecvSink,
    ) -> Result<(), AgentError> {
        let raw = Box::into_raw(Box::new(sink));
        let rc = unsafe { (self.attach)(self.user_data, stream_id, component_id, raw as *mut c_void) };
        if rc != 0 {
            drop(unsafe { Box::from_raw(raw) });
            return Err(AgentError::Rejected(format!("host attach returned {}", rc)));
        }
        if let Some(old) = self.sinks.lock().insert((stream_id, component_id), raw) {
            drop(unsafe { Box::from_raw(old) });
        }
        Ok(())
    }

    fn detach_recv(&self, stream_id: u32, component_id: u32) {
        unsafe { (self.detach)(self.user_data, stream_id, component_id) };
        if let Some(raw) = self.sinks.lock().remove(&(stream_id, component_id)) {
            drop(unsafe { Box::from_raw(raw) });
        }
    }

    fn local_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate> {
        self.fetch_candidates(stream_id, component_id, false)
    }

    fn remote_candidates(&self, stream_id: u32, component_id: u32) -> Vec<Candidate> {
        self.fetch_candidates(stream_id, component_id, true)
    }

    fn connect_selected_pair(&self, handler: SelectedPairHandler) -> SubscriptionId {
        self.selected_pair.connect(handler)
    }

    fn disconnect_selected_pair(&self, id: SubscriptionId) {
        self.selected_pair.disconnect(id);
    }
}

impl Drop for HostAgent {
    fn drop(&mut self) {
        for (_, raw) in self.sinks.get_mut().drain() {
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Library version, NUL-terminated.
#[no_mangle]
pub extern "C" fn nicesrc_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Wrap a host agent. Returns opaque handle or null if the vtable is null or incomplete.
#[no_mangle]
pub extern "C" fn nicesrc_agent_new(
    vtable: *const NiceSrcAgentVTable,
    user_data: *mut c_void,
) -> *mut c_void {
    if vtable.is_null() {
        return std::ptr::null_mut();
    }
    let vtable = unsafe { &*vtable };
    let (Some(attach), Some(detach), Some(candidates)) =
        (vtable.attach_recv, vtable.detach_recv, vtable.get_candidates)
    else {
        return std::ptr::null_mut();
    };
    let agent = Arc::new(HostAgent {
        attach,
        detach,
        candidates,
        user_data,
        sinks: Mutex::new(HashMap::new()),
        selected_pair: SelectedPairSignal::new(),
    });
    Box::into_raw(Box::new(agent)) as *mut c_void
}

/// Release the host's reference. Sources holding the agent keep it alive. No-op if null.
#[no_mangle]
pub extern "C" fn nicesrc_agent_free(agent: *mut c_void) {
    if agent.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(agent as *mut Arc<HostAgent>) };
}

/// Announce a newly selected pair. Foundations are NUL-terminated. Returns 0, or -1 on bad arguments.
#[no_mangle]
pub extern "C" fn nicesrc_agent_emit_selected_pair(
    agent: *mut c_void,
    stream_id: u32,
    component_id: u32,
    local_foundation: *const c_char,
    remote_foundation: *const c_char,
) -> c_int {
    if agent.is_null() || local_foundation.is_null() || remote_foundation.is_null() {
        return NICESRC_ERROR;
    }
    let agent = unsafe { &*(agent as *const Arc<HostAgent>) };
    let (local, remote) = unsafe {
        (
            CStr::from_ptr(local_foundation).to_string_lossy().into_owned(),
            CStr::from_ptr(remote_foundation).to_string_lossy().into_owned(),
        )
    };
    agent.selected_pair.emit(&SelectedPair {
        stream_id,
        component_id,
        local_foundation: local,
        remote_foundation: remote,
    });
    NICESRC_OK
}

/// Deliver one datagram to an attached sink. Returns 0, or -1 if the source is gone or args are null.
#[no_mangle]
pub extern "C" fn nicesrc_sink_deliver(
    sink: *mut c_void,
    stream_id: u32,
    component_id: u32,
    data: *const u8,
    len: usize,
) -> c_int {
    if sink.is_null() || (data.is_null() && len > 0) {
        return NICESRC_ERROR;
    }
    let sink = unsafe { &*(sink as *const RecvSink) };
    let payload: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, len) }
    };
    if sink.deliver(stream_id, component_id, payload) {
        NICESRC_OK
    } else {
        NICESRC_ERROR
    }
}

/// Create a source. Returns opaque handle.
#[no_mangle]
pub extern "C" fn nicesrc_create() -> *mut c_void {
    Box::into_raw(Box::new(NiceSrc::new())) as *mut c_void
}

/// Destroy a source. No pull may be running. No-op if null.
#[no_mangle]
pub extern "C" fn nicesrc_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut NiceSrc) };
}

fn property_rc(result: Result<(), PropertyError>) -> c_int {
    match result {
        Ok(()) => NICESRC_OK,
        Err(_) => NICESRC_ERROR,
    }
}

/// Bind an agent handle. Returns -1 if an agent is already set or the source is active.
#[no_mangle]
pub extern "C" fn nicesrc_set_agent(h: *mut c_void, agent: *mut c_void) -> c_int {
    if h.is_null() || agent.is_null() {
        return NICESRC_ERROR;
    }
    let src = unsafe { &*(h as *const NiceSrc) };
    let agent = unsafe { &*(agent as *const Arc<HostAgent>) };
    let agent: Arc<dyn Agent> = agent.clone();
    property_rc(src.set_agent(agent))
}

#[no_mangle]
pub extern "C" fn nicesrc_set_stream(h: *mut c_void, stream_id: u32) -> c_int {
    if h.is_null() {
        return NICESRC_ERROR;
    }
    let src = unsafe { &*(h as *const NiceSrc) };
    property_rc(src.set_stream_id(stream_id))
}

/// Current stream id, 0 if unset or h is null.
#[no_mangle]
pub extern "C" fn nicesrc_get_stream(h: *mut c_void) -> u32 {
    if h.is_null() {
        return 0;
    }
    unsafe { &*(h as *const NiceSrc) }.stream_id()
}

#[no_mangle]
pub extern "C" fn nicesrc_set_component(h: *mut c_void, component_id: u32) -> c_int {
    if h.is_null() {
        return NICESRC_ERROR;
    }
    let src = unsafe { &*(h as *const NiceSrc) };
    property_rc(src.set_component_id(component_id))
}

/// Current component id, 0 if unset or h is null.
#[no_mangle]
pub extern "C" fn nicesrc_get_component(h: *mut c_void) -> u32 {
    if h.is_null() {
        return 0;
    }
    unsafe { &*(h as *const NiceSrc) }.component_id()
}

/// Perform one state transition (NICESRC_NULL_TO_READY etc.). Returns 0 or -1.
#[no_mangle]
pub extern "C" fn nicesrc_change_state(h: *mut c_void, transition: c_int) -> c_int {
    if h.is_null() {
        return NICESRC_ERROR;
    }
    let transition = match transition {
        NICESRC_NULL_TO_READY => StateChange::NullToReady,
        NICESRC_READY_TO_PAUSED => StateChange::ReadyToPaused,
        NICESRC_PAUSED_TO_PLAYING => StateChange::PausedToPlaying,
        NICESRC_PLAYING_TO_PAUSED => StateChange::PlayingToPaused,
        NICESRC_PAUSED_TO_READY => StateChange::PausedToReady,
        NICESRC_READY_TO_NULL => StateChange::ReadyToNull,
        _ => return NICESRC_ERROR,
    };
    let src = unsafe { &*(h as *const NiceSrc) };
    match src.change_state(transition) {
        Ok(()) => NICESRC_OK,
        Err(_) => NICESRC_ERROR,
    }
}

/// Socket address handed to the host. `family` 0 means unset; `addr` holds 4 or 16 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiceSrcAddress {
    pub family: u16,
    pub port: u16,
    pub addr: [u8; 16],
}

impl NiceSrcAddress {
    const UNSET: NiceSrcAddress = NiceSrcAddress {
        family: 0,
        port: 0,
        addr: [0; 16],
    };

    fn from_socket(addr: Option<SocketAddr>) -> Self {
        let mut out = Self::UNSET;
        match addr.map(TransportAddress::from) {
            Some(TransportAddress::Ipv4 { ip, port }) => {
                out.family = AF_INET;
                out.port = port;
                out.addr[..4].copy_from_slice(&ip);
            }
            Some(TransportAddress::Ipv6 { ip, port }) => {
                out.family = AF_INET6;
                out.port = port;
                out.addr = ip;
            }
            Some(TransportAddress::Unsupported { .. }) | None => {}
        }
        out
    }
}

/// Metadata of a pulled buffer. `from` is the remote end of the selected pair, `to` the local end.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiceSrcBufferInfo {
    pub offset: u64,
    /// Running time in nanoseconds; valid only when `has_pts` is 1.
    pub pts_ns: u64,
    pub has_pts: c_int,
    pub from: NiceSrcAddress,
    pub to: NiceSrcAddress,
}

impl NiceSrcBufferInfo {
    fn from_buffer(buf: &NetBuffer) -> Self {
        Self {
            offset: buf.offset,
            pts_ns: buf
                .pts
                .map(|pts| u64::try_from(pts.as_nanos()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            has_pts: buf.pts.is_some() as c_int,
            from: NiceSrcAddress::from_socket(buf.from),
            to: NiceSrcAddress::from_socket(buf.to),
        }
    }
}

/// Block until one datagram arrives; copy it into out_buf and its length into out_written.
/// If out_info is non-null it receives the buffer's addresses and timestamp.
/// Returns 0, NICESRC_WRONG_STATE when unlocked, or -1 on error. If out_buf is too small the
/// datagram is dropped, out_written holds the needed size, and -1 is returned.
#[no_mangle]
pub extern "C" fn nicesrc_pull(
    h: *mut c_void,
    offset: u64,
    length: u32,
    out_buf: *mut u8,
    out_buf_len: usize,
    out_written: *mut usize,
    out_info: *mut NiceSrcBufferInfo,
) -> c_int {
    if h.is_null() || out_written.is_null() {
        return NICESRC_ERROR;
    }
    let src = unsafe { &*(h as *const NiceSrc) };
    let buf = match src.pull(offset, length) {
        Ok(buf) => buf,
        Err(FlowError::WrongState) => return NICESRC_WRONG_STATE,
    };
    unsafe {
        *out_written = buf.len();
    }
    if buf.len() > out_buf_len || (out_buf.is_null() && !buf.is_empty()) {
        warn!(len = buf.len(), out_buf_len, "pull buffer too small, datagram dropped");
        return NICESRC_ERROR;
    }
    if !buf.is_empty() {
        unsafe {
            out_buf.copy_from_nonoverlapping(buf.data.as_ptr(), buf.len());
        }
    }
    if !out_info.is_null() {
        unsafe {
            *out_info = NiceSrcBufferInfo::from_buffer(&buf);
        }
    }
    NICESRC_OK
}

/// Interrupt a blocked pull. Safe to call from any thread.
#[no_mangle]
pub extern "C" fn nicesrc_unlock(h: *mut c_void) -> c_int {
    if h.is_null() {
        return NICESRC_ERROR;
    }
    unsafe { &*(h as *const NiceSrc) }.unlock();
    NICESRC_OK
}

#[no_mangle]
pub extern "C" fn nicesrc_unlock_stop(h: *mut c_void) -> c_int {
    if h.is_null() {
        return NICESRC_ERROR;
    }
    unsafe { &*(h as *const NiceSrc) }.unlock_stop();
    NICESRC_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    /// Host-side agent state reached through user_data.
    #[derive(Default)]
    struct TestHost {
        sink: std::sync::Mutex<Option<usize>>,
        detached: std::sync::Mutex<usize>,
        locals: Vec<NiceSrcCandidate>,
        remotes: Vec<NiceSrcCandidate>,
    }

    fn candidate(foundation: &str, family: u16, addr: &[u8], port: u16) -> NiceSrcCandidate {
        let mut c = NiceSrcCandidate::EMPTY;
        c.foundation[..foundation.len()].copy_from_slice(foundation.as_bytes());
        c.family = family;
        c.port = port;
        c.addr[..addr.len()].copy_from_slice(addr);
        c
    }

    unsafe extern "C" fn attach(user_data: *mut c_void, _s: u32, _c: u32, sink: *mut c_void) -> c_int {
        let host = &*(user_data as *const TestHost);
        *host.sink.lock().unwrap() = Some(sink as usize);
        0
    }

    unsafe extern "C" fn detach(user_data: *mut c_void, _s: u32, _c: u32) {
        let host = &*(user_data as *const TestHost);
        *host.sink.lock().unwrap() = None;
        *host.detached.lock().unwrap() += 1;
    }

    unsafe extern "C" fn candidates(
        user_data: *mut c_void,
        _s: u32,
        _c: u32,
        remote: c_int,
        out: *mut NiceSrcCandidate,
        cap: usize,
    ) -> c_int {
        let host = &*(user_data as *const TestHost);
        let list = if remote != 0 { &host.remotes } else { &host.locals };
        for (i, c) in list.iter().take(cap).enumerate() {
            *out.add(i) = *c;
        }
        list.len() as c_int
    }

    unsafe extern "C" fn refuse(_: *mut c_void, _: u32, _: u32, _: *mut c_void) -> c_int {
        -1
    }

    fn vtable() -> NiceSrcAgentVTable {
        NiceSrcAgentVTable {
            attach_recv: Some(attach),
            detach_recv: Some(detach),
            get_candidates: Some(candidates),
        }
    }

    fn host_ptr(host: &TestHost) -> *mut c_void {
        host as *const TestHost as *mut c_void
    }

    fn active_source(host: &TestHost) -> (*mut c_void, *mut c_void) {
        let vt = vtable();
        let agent = nicesrc_agent_new(&vt, host_ptr(host));
        assert!(!agent.is_null());
        let h = nicesrc_create();
        assert_eq!(nicesrc_set_agent(h, agent), NICESRC_OK);
        assert_eq!(nicesrc_set_stream(h, 1), NICESRC_OK);
        assert_eq!(nicesrc_set_component(h, 1), NICESRC_OK);
        assert_eq!(nicesrc_change_state(h, NICESRC_NULL_TO_READY), NICESRC_OK);
        (h, agent)
    }

    fn sink_of(host: &TestHost) -> *mut c_void {
        host.sink.lock().unwrap().expect("sink attached") as *mut c_void
    }

    fn pull_into(h: *mut c_void, out: &mut [u8], written: &mut usize) -> c_int {
        nicesrc_pull(h, 0, 4096, out.as_mut_ptr(), out.len(), written, std::ptr::null_mut())
    }

    fn pull_with_info(h: *mut c_void, offset: u64) -> (Vec<u8>, NiceSrcBufferInfo) {
        let mut out = [0u8; 64];
        let mut written = 0usize;
        let mut info = NiceSrcBufferInfo {
            offset: u64::MAX,
            pts_ns: 0,
            has_pts: -1,
            from: NiceSrcAddress::UNSET,
            to: NiceSrcAddress::UNSET,
        };
        let rc = nicesrc_pull(
            h,
            offset,
            4096,
            out.as_mut_ptr(),
            out.len(),
            &mut written,
            &mut info,
        );
        assert_eq!(rc, NICESRC_OK);
        (out[..written].to_vec(), info)
    }

    #[test]
    fn version_is_c_string() {
        let v = unsafe { CStr::from_ptr(nicesrc_version()) };
        assert_eq!(v.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn incomplete_vtable_rejected() {
        let vt = NiceSrcAgentVTable {
            attach_recv: Some(attach),
            detach_recv: None,
            get_candidates: Some(candidates),
        };
        assert!(nicesrc_agent_new(&vt, std::ptr::null_mut()).is_null());
        assert!(nicesrc_agent_new(std::ptr::null(), std::ptr::null_mut()).is_null());
    }

    #[test]
    fn start_without_configuration_fails() {
        let h = nicesrc_create();
        assert_eq!(nicesrc_change_state(h, NICESRC_NULL_TO_READY), NICESRC_ERROR);
        assert_eq!(nicesrc_change_state(h, 42), NICESRC_ERROR);
        assert_eq!(nicesrc_get_stream(h), 0);
        nicesrc_destroy(h);
    }

    #[test]
    fn pull_copies_datagram() {
        let host = TestHost::default();
        let (h, agent) = active_source(&host);
        assert_eq!(nicesrc_get_stream(h), 1);
        assert_eq!(nicesrc_get_component(h), 1);

        let payload = [9u8; 10];
        assert_eq!(
            nicesrc_sink_deliver(sink_of(&host), 1, 1, payload.as_ptr(), payload.len()),
            NICESRC_OK
        );
        let mut out = [0u8; 64];
        let mut written = 0usize;
        let rc = pull_into(h, &mut out, &mut written);
        assert_eq!(rc, NICESRC_OK);
        assert_eq!(written, 10);
        assert_eq!(&out[..10], &payload);

        assert_eq!(nicesrc_change_state(h, NICESRC_READY_TO_NULL), NICESRC_OK);
        assert_eq!(*host.detached.lock().unwrap(), 1);
        assert!(host.sink.lock().unwrap().is_none());
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn addresses_unset_before_pair_selected() {
        let host = TestHost::default();
        let (h, agent) = active_source(&host);
        nicesrc_sink_deliver(sink_of(&host), 1, 1, [1u8, 2].as_ptr(), 2);
        let (data, info) = pull_with_info(h, 0);
        assert_eq!(data, [1, 2]);
        assert_eq!(info.from, NiceSrcAddress::UNSET);
        assert_eq!(info.to, NiceSrcAddress::UNSET);
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn small_buffer_reports_needed_size() {
        let host = TestHost::default();
        let (h, agent) = active_source(&host);
        let payload = [1u8; 32];
        nicesrc_sink_deliver(sink_of(&host), 1, 1, payload.as_ptr(), payload.len());
        let mut out = [0u8; 8];
        let mut written = 0usize;
        let rc = pull_into(h, &mut out, &mut written);
        assert_eq!(rc, NICESRC_ERROR);
        assert_eq!(written, 32);
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn unlocked_pull_is_wrong_state() {
        let host = TestHost::default();
        let (h, agent) = active_source(&host);
        assert_eq!(nicesrc_unlock(h), NICESRC_OK);
        let mut out = [0u8; 8];
        let mut written = 0usize;
        assert_eq!(
            pull_into(h, &mut out, &mut written),
            NICESRC_WRONG_STATE
        );
        assert_eq!(nicesrc_unlock_stop(h), NICESRC_OK);
        nicesrc_sink_deliver(sink_of(&host), 1, 1, [5u8].as_ptr(), 1);
        assert_eq!(
            pull_into(h, &mut out, &mut written),
            NICESRC_OK
        );
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn selected_pair_reaches_source() {
        let host = TestHost {
            locals: vec![candidate("1", AF_INET, &[192, 168, 0, 5], 5000)],
            remotes: vec![
                candidate("7", AF_INET, &[198, 51, 100, 1], 6000),
                candidate(
                    "8",
                    AF_INET6,
                    &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                    6001,
                ),
            ],
            ..TestHost::default()
        };
        let (h, agent) = active_source(&host);
        let local = CString::new("1").unwrap();
        let remote = CString::new("8").unwrap();
        assert_eq!(
            nicesrc_agent_emit_selected_pair(agent, 1, 1, local.as_ptr(), remote.as_ptr()),
            NICESRC_OK
        );
        nicesrc_sink_deliver(sink_of(&host), 1, 1, b"rtp".as_ptr(), 3);
        let (data, info) = pull_with_info(h, 9);
        assert_eq!(data, b"rtp");
        assert_eq!(info.offset, 9);
        assert_eq!(info.has_pts, 1);
        assert_eq!(info.from.family, AF_INET6);
        assert_eq!(info.from.port, 6001);
        assert_eq!(
            info.from.addr,
            [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert_eq!(info.to.family, AF_INET);
        assert_eq!(info.to.port, 5000);
        assert_eq!(&info.to.addr[..4], &[192, 168, 0, 5]);
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn candidate_lookup_grows_past_initial_capacity() {
        let remotes: Vec<NiceSrcCandidate> = (0..(INITIAL_CANDIDATE_CAPACITY as u16 + 4))
            .map(|i| candidate(&i.to_string(), AF_INET, &[10, 0, 0, 1], 1000 + i))
            .collect();
        let host = TestHost {
            remotes,
            ..TestHost::default()
        };
        let vt = vtable();
        let agent = nicesrc_agent_new(&vt, host_ptr(&host));
        let arc = unsafe { &*(agent as *const Arc<HostAgent>) };
        let found = arc.remote_candidates(1, 1);
        assert_eq!(found.len(), INITIAL_CANDIDATE_CAPACITY + 4);
        assert_eq!(found.last().unwrap().foundation, "19");
        nicesrc_agent_free(agent);
    }

    #[test]
    fn refused_attach_fails_start() {
        let host = TestHost::default();
        let vt = NiceSrcAgentVTable {
            attach_recv: Some(refuse),
            detach_recv: Some(detach),
            get_candidates: Some(candidates),
        };
        let agent = nicesrc_agent_new(&vt, host_ptr(&host));
        let h = nicesrc_create();
        nicesrc_set_agent(h, agent);
        nicesrc_set_stream(h, 1);
        nicesrc_set_component(h, 1);
        assert_eq!(nicesrc_change_state(h, NICESRC_NULL_TO_READY), NICESRC_ERROR);
        assert_eq!(nicesrc_set_agent(h, agent), NICESRC_ERROR);
        nicesrc_destroy(h);
        nicesrc_agent_free(agent);
    }

    #[test]
    fn destroying_active_source_detaches() {
        let host = TestHost::default();
        let (h, agent) = active_source(&host);
        nicesrc_destroy(h);
        assert!(host.sink.lock().unwrap().is_none());
        assert_eq!(*host.detached.lock().unwrap(), 1);
        assert_eq!(
            nicesrc_sink_deliver(std::ptr::null_mut(), 1, 1, [0u8].as_ptr(), 1),
            NICESRC_ERROR
        );
        let arc = unsafe { &*(agent as *const Arc<HostAgent>) };
        assert_eq!(arc.selected_pair.handler_count(), 0);
        nicesrc_agent_free(agent);
    }
}
