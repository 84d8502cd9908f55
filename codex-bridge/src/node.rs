//! Node handle: owns one native instance, its lifecycle and its sessions.

use std::ffi::{c_void, CString};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::call::{self, PendingCall};
use crate::config::{LogLevel, NodeConfig};
use crate::error::{BridgeError, Result};
use crate::events::{on_native_event, Event, EventRouter};
use crate::ffi::RET_OK;
use crate::native::{NativeApi, NodePtr, Request};
use crate::registry::lock;
use crate::session::{ContentId, SessionTable};

/// Process-unique node identifier, used as the event callback's `user_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_user_data(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn from_user_data(user_data: *mut c_void) -> Self {
        NodeId(user_data as usize)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Starting => "starting",
            Lifecycle::Started => "started",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Destroying => "destroying",
            Lifecycle::Destroyed => "destroyed",
        }
    }
}

/// Move `lifecycle` from one of `allowed` to `via`. Returns the state it left.
fn enter(
    lifecycle: &Mutex<Lifecycle>,
    op: &'static str,
    allowed: &[Lifecycle],
    via: Lifecycle,
) -> Result<Lifecycle> {
    let mut state = lock(lifecycle);
    if !allowed.contains(&*state) {
        return Err(BridgeError::InvalidLifecycle {
            op,
            state: state.as_str(),
        });
    }
    let previous = *state;
    *state = via;
    Ok(previous)
}

fn settle<T>(lifecycle: &Mutex<Lifecycle>, result: &Result<T>, next: Lifecycle, previous: Lifecycle) {
    *lock(lifecycle) = if result.is_ok() { next } else { previous };
}

/// Handle to one native node instance.
///
/// Requests may be issued from any thread. `destroy` consumes the handle; dropping it
/// without destroying leaks the native instance and logs a warning.
pub struct Node {
    api: Arc<dyn NativeApi>,
    ctx: NodePtr,
    id: NodeId,
    lifecycle: Arc<Mutex<Lifecycle>>,
    pub(crate) sessions: SessionTable,
    events_bound: AtomicBool,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a native instance from `config`. Blocks until the creation call completes.
    pub fn new(api: Arc<dyn NativeApi>, config: &NodeConfig) -> Result<Self> {
        let json = CString::new(config.to_json()?)?;
        let mut raw = ptr::null_mut();
        call::call("codex_new", |cb, ud| {
            raw = api.create(&json, cb, ud);
            RET_OK
        })?;
        let ctx = NodePtr::from_raw(raw);
        if ctx.is_null() {
            return Err(BridgeError::NullContext);
        }
        let id = NodeId::next();
        tracing::info!(node = %id, "node created");
        Ok(Self {
            api,
            ctx,
            id,
            lifecycle: Arc::new(Mutex::new(Lifecycle::Created)),
            sessions: SessionTable::default(),
            events_bound: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    pub(crate) fn request(&self, request: Request<'_>) -> Result<Vec<u8>> {
        call::call(request.name(), |cb, ud| {
            self.api.invoke(self.ctx, &request, cb, ud)
        })
    }

    pub(crate) fn request_string(&self, request: Request<'_>) -> Result<String> {
        Ok(String::from_utf8(self.request(request)?)?)
    }

    pub(crate) fn request_streaming<S>(&self, request: Request<'_>, on_chunk: S) -> Result<Vec<u8>>
    where
        S: FnMut(&[u8]) -> Result<()>,
    {
        call::call_streaming(
            request.name(),
            |cb, ud| self.api.invoke(self.ctx, &request, cb, ud),
            on_chunk,
        )
    }

    fn request_async(&self, request: Request<'_>) -> Result<PendingCall> {
        call::call_async(request.name(), |cb, ud| {
            self.api.invoke(self.ctx, &request, cb, ud)
        })
    }

    pub fn version(&self) -> Result<String> {
        self.request_string(Request::Version)
    }

    pub fn revision(&self) -> Result<String> {
        self.request_string(Request::Revision)
    }

    pub fn repo(&self) -> Result<String> {
        self.request_string(Request::Repo)
    }

    /// Node debug information (JSON).
    pub fn debug(&self) -> Result<String> {
        self.request_string(Request::Debug)
    }

    pub fn spr(&self) -> Result<String> {
        self.request_string(Request::Spr)
    }

    pub fn peer_id(&self) -> Result<String> {
        self.request_string(Request::PeerId)
    }

    pub fn set_log_level(&self, level: LogLevel) -> Result<()> {
        let level = CString::new(level.as_str())?;
        self.request(Request::LogLevel { level: &level })?;
        Ok(())
    }

    /// Dial `peer_id`, optionally at the given multiaddresses.
    pub fn connect<A: AsRef<str>>(&self, peer_id: &str, addrs: &[A]) -> Result<()> {
        let peer = CString::new(peer_id)?;
        let addrs = addrs
            .iter()
            .map(|a| CString::new(a.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.request(Request::Connect {
            peer_id: &peer,
            addrs: &addrs,
        })?;
        tracing::debug!(node = %self.id, peer = peer_id, addrs = addrs.len(), "connected");
        Ok(())
    }

    pub fn peer_debug(&self, peer_id: &str) -> Result<String> {
        let peer = CString::new(peer_id)?;
        self.request_string(Request::PeerDebug { peer_id: &peer })
    }

    /// Manifests of the locally stored datasets (JSON).
    pub fn list(&self) -> Result<String> {
        self.request_string(Request::StorageList)
    }

    /// Storage usage summary (JSON).
    pub fn space(&self) -> Result<String> {
        self.request_string(Request::StorageSpace)
    }

    pub fn delete(&self, cid: &ContentId) -> Result<()> {
        let cid = CString::new(cid.as_str())?;
        self.request(Request::StorageDelete { cid: &cid })?;
        Ok(())
    }

    /// Fetch `cid` from the network into local storage; returns its manifest (JSON).
    pub fn fetch(&self, cid: &ContentId) -> Result<String> {
        let cid = CString::new(cid.as_str())?;
        self.request_string(Request::StorageFetch { cid: &cid })
    }

    pub fn exists(&self, cid: &ContentId) -> Result<bool> {
        let cid = CString::new(cid.as_str())?;
        let payload = self.request_string(Request::StorageExists { cid: &cid })?;
        Ok(serde_json::from_str(payload.trim())?)
    }

    pub fn start(&self) -> Result<()> {
        let previous = enter(
            &self.lifecycle,
            "start",
            &[Lifecycle::Created, Lifecycle::Stopped],
            Lifecycle::Starting,
        )?;
        let result = self.request(Request::Start);
        settle(&self.lifecycle, &result, Lifecycle::Started, previous);
        result?;
        tracing::info!(node = %self.id, "node started");
        Ok(())
    }

    /// Issue the start call and return immediately; `on_done` runs on a background
    /// thread once the node has started (or failed to).
    pub fn start_async<F>(&self, on_done: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let previous = enter(
            &self.lifecycle,
            "start",
            &[Lifecycle::Created, Lifecycle::Stopped],
            Lifecycle::Starting,
        )?;
        let pending = match self.request_async(Request::Start) {
            Ok(pending) => pending,
            Err(e) => {
                *lock(&self.lifecycle) = previous;
                return Err(e);
            }
        };
        let lifecycle = self.lifecycle.clone();
        let id = self.id;
        let spawned = pending.on_complete(move |result| {
            let result = result.map(|_| ());
            settle(&lifecycle, &result, Lifecycle::Started, previous);
            match &result {
                Ok(()) => tracing::info!(node = %id, "node started"),
                Err(e) => tracing::warn!(node = %id, error = %e, "node failed to start"),
            }
            on_done(result);
        });
        if let Err(e) = spawned {
            // The call is in flight but nobody will observe it.
            *lock(&self.lifecycle) = previous;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let previous = enter(
            &self.lifecycle,
            "stop",
            &[Lifecycle::Started],
            Lifecycle::Stopping,
        )?;
        let result = self.request(Request::Stop);
        settle(&self.lifecycle, &result, Lifecycle::Stopped, previous);
        result?;
        tracing::info!(node = %self.id, "node stopped");
        Ok(())
    }

    /// Release the native instance. Only valid before start or after a successful stop.
    pub fn destroy(self) -> Result<()> {
        let previous = enter(
            &self.lifecycle,
            "destroy",
            &[Lifecycle::Created, Lifecycle::Stopped],
            Lifecycle::Destroying,
        )?;
        let result = self.request(Request::Destroy);
        settle(&self.lifecycle, &result, Lifecycle::Destroyed, previous);
        result?;
        EventRouter::global().unregister(self.id);
        tracing::info!(node = %self.id, "node destroyed");
        Ok(())
    }

    /// Route this node's events to `handler`, replacing any previous one.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        EventRouter::global().register(self.id, Arc::new(handler));
        if !self.events_bound.swap(true, Ordering::SeqCst) {
            self.api
                .set_event_callback(self.ctx, on_native_event, self.id.as_user_data());
            tracing::debug!(node = %self.id, "event callback registered");
        }
    }

    /// Stop delivering events to the current handler. Later events are dropped.
    pub fn clear_event_handler(&self) {
        EventRouter::global().unregister(self.id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        EventRouter::global().unregister(self.id);
        let state = self.lifecycle();
        if state != Lifecycle::Destroyed {
            tracing::warn!(node = %self.id, state = state.as_str(), "node dropped without destroy; native instance leaked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{init_test_tracing, SimNative};
    use std::sync::mpsc;
    use std::time::Duration;

    fn node() -> (Arc<SimNative>, Node) {
        init_test_tracing();
        let sim = Arc::new(SimNative::new());
        let node = Node::new(sim.clone(), &NodeConfig::default()).unwrap();
        (sim, node)
    }

    #[test]
    fn creation_passes_config_json() {
        init_test_tracing();
        let sim = Arc::new(SimNative::new());
        let config = NodeConfig {
            log_level: Some(LogLevel::Info),
            ..Default::default()
        };
        let _node = Node::new(sim.clone(), &config).unwrap();
        assert_eq!(sim.last_config().as_deref(), Some(r#"{"log-level":"INFO"}"#));
    }

    #[test]
    fn creation_failure_is_reported() {
        init_test_tracing();
        let sim = Arc::new(SimNative::new());
        sim.fail_call("codex_new", 0, "data dir is locked");
        let err = Node::new(sim, &NodeConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "data dir is locked");
    }

    #[test]
    fn unary_queries() {
        let (_sim, node) = node();
        assert!(!node.version().unwrap().is_empty());
        assert!(!node.revision().unwrap().is_empty());
        assert!(!node.peer_id().unwrap().is_empty());
        assert!(node.spr().unwrap().starts_with("spr:"));
        node.set_log_level(LogLevel::Debug).unwrap();
        node.connect("16Uiu2HAm", &["/ip4/127.0.0.1/tcp/8070"]).unwrap();
    }

    #[test]
    fn rejected_call_reports_entry_point_and_code() {
        let (sim, node) = node();
        sim.reject_call("codex_version", 0, 2);
        let err = node.version().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed the call to codex_version. Returned code: 2."
        );
        // The node stays usable.
        assert!(node.version().is_ok());
    }

    #[test]
    fn lifecycle_transitions() {
        let (_sim, node) = node();
        assert_eq!(node.lifecycle(), Lifecycle::Created);
        assert!(matches!(
            node.stop(),
            Err(BridgeError::InvalidLifecycle { op: "stop", state: "created" })
        ));
        node.start().unwrap();
        assert_eq!(node.lifecycle(), Lifecycle::Started);
        assert!(node.start().is_err());
        node.stop().unwrap();
        node.start().unwrap();
        node.stop().unwrap();
        node.destroy().unwrap();
    }

    #[test]
    fn destroy_while_started_is_rejected() {
        let (sim, node) = node();
        node.start().unwrap();
        let err = node.destroy().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidLifecycle {
                op: "destroy",
                state: "started"
            }
        ));
        assert_eq!(sim.calls("codex_destroy"), 0);
    }

    #[test]
    fn failed_start_restores_state() {
        let (sim, node) = node();
        sim.fail_call("codex_start", 0, "port in use");
        assert!(node.start().is_err());
        assert_eq!(node.lifecycle(), Lifecycle::Created);
        node.start().unwrap();
    }

    #[test]
    fn start_async_reports_completion() {
        let (_sim, node) = node();
        let (tx, rx) = mpsc::channel();
        node.start_async(move |r| tx.send(r.is_ok()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(node.lifecycle(), Lifecycle::Started);
        node.stop().unwrap();
    }

    #[test]
    fn events_are_routed_per_node() {
        let (sim, a) = node();
        let b = Node::new(sim.clone(), &NodeConfig::default()).unwrap();
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        a.set_event_handler(move |e| tx_a.send(e.message_lossy()).unwrap());
        b.set_event_handler(move |e| tx_b.send(e.message_lossy()).unwrap());
        sim.emit_event(a.ctx, 0, b"for a");
        sim.emit_event(b.ctx, 0, b"for b");
        assert_eq!(rx_a.recv_timeout(Duration::from_secs(5)).unwrap(), "for a");
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(5)).unwrap(), "for b");
        assert_eq!(sim.calls("codex_set_event_callback"), 2);
    }

    #[test]
    fn replacing_handler_binds_native_callback_once() {
        let (sim, node) = node();
        node.set_event_handler(|_| {});
        let (tx, rx) = mpsc::channel();
        node.set_event_handler(move |e| tx.send(e.code).unwrap());
        sim.emit_event(node.ctx, 7, b"");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(sim.calls("codex_set_event_callback"), 1);
    }

    #[test]
    fn destroy_unregisters_events() {
        let (_sim, node) = node();
        node.set_event_handler(|_| {});
        let id = node.id();
        assert!(EventRouter::global().is_registered(id));
        node.destroy().unwrap();
        assert!(!EventRouter::global().is_registered(id));
    }

    #[test]
    fn dropped_node_unregisters_events() {
        let (_sim, node) = node();
        node.set_event_handler(|_| {});
        let id = node.id();
        drop(node);
        assert!(!EventRouter::global().is_registered(id));
    }

    #[test]
    fn storage_helpers() {
        let (_sim, node) = node();
        let cid = node
            .upload_reader(
                std::io::Cursor::new(b"stored"),
                &crate::UploadOptions::default(),
                None,
                |_| {},
            )
            .unwrap();
        assert!(node.exists(&cid).unwrap());
        assert!(node.list().unwrap().contains(cid.as_str()));
        assert!(node.space().unwrap().contains("totalBlocks"));
        assert!(node.fetch(&cid).unwrap().contains("datasetSize"));
        node.delete(&cid).unwrap();
        assert!(!node.exists(&cid).unwrap());
    }

    #[test]
    fn interior_nul_is_invalid_argument() {
        let (_sim, node) = node();
        assert!(matches!(
            node.peer_debug("bad\0peer"),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn node_id_survives_user_data() {
        let id = NodeId::next();
        assert_eq!(NodeId::from_user_data(id.as_user_data()), id);
        let widest = NodeId(usize::MAX);
        assert_eq!(NodeId::from_user_data(widest.as_user_data()), widest);
    }
}
