//! In-process simulated native component.
//!
//! Implements [`NativeApi`] with an in-memory content store and delivers every
//! notification from a dedicated worker thread, the way the real library calls back from
//! its own threads. Faults (failures, rejections, duplicate terminals) can be injected
//! per entry point.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::ffi::{CodexCallback, RET_ERR, RET_OK, RET_PROGRESS};
use crate::native::{NativeApi, NodePtr, Request};
use crate::registry::lock;
use crate::session::{effective_chunk_size, DEFAULT_CHUNK_SIZE};

const SIM_VERSION: &str = "v0.0.0-sim";
const SIM_REVISION: &str = "0000000";
const SIM_SPR: &str = "spr:CiUIAhIhA1SimulatedNodeRecord";

#[derive(Debug, Clone)]
enum FaultAction {
    Fail(String),
    Reject(c_int),
    Duplicate,
}

#[derive(Debug, Clone)]
struct Fault {
    call: &'static str,
    /// Fires on the invocation with this 0-based index.
    at: usize,
    action: FaultAction,
}

#[derive(Debug)]
struct Stored {
    data: Vec<u8>,
    filename: Option<String>,
    mimetype: Option<String>,
}

#[derive(Debug)]
struct Upload {
    filename: Option<String>,
    mimetype: Option<String>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Download {
    offset: usize,
    chunk_size: usize,
}

#[derive(Debug, Default)]
struct SimNode {
    running: bool,
    store: BTreeMap<String, Stored>,
    uploads: HashMap<String, Upload>,
    downloads: HashMap<String, Download>,
    events: Option<(CodexCallback, usize)>,
}

#[derive(Debug, Default)]
struct SimState {
    next_node: usize,
    nodes: HashMap<usize, SimNode>,
    calls: HashMap<&'static str, usize>,
    faults: Vec<Fault>,
    last_config: Option<String>,
}

impl SimState {
    /// Count the invocation and take the fault scheduled for it, if any.
    fn record(&mut self, call: &'static str) -> Option<FaultAction> {
        let n = self.calls.entry(call).or_insert(0);
        let index = *n;
        *n += 1;
        let pos = self
            .faults
            .iter()
            .position(|f| f.call == call && f.at == index)?;
        Some(self.faults.remove(pos).action)
    }

    fn schedule(&mut self, call: &'static str, after: usize, action: FaultAction) {
        let at = self.calls.get(call).copied().unwrap_or(0) + after;
        self.faults.push(Fault { call, at, action });
    }
}

/// Notifications for one callback, delivered in order by the worker.
struct Delivery {
    callback: CodexCallback,
    user_data: usize,
    notes: Vec<(c_int, Vec<u8>)>,
}

/// Simulated libcodex.
pub struct SimNative {
    state: Mutex<SimState>,
    worker: Mutex<mpsc::Sender<Delivery>>,
}

impl Default for SimNative {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNative {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Delivery>();
        // Spawn failure leaves the receiver dropped; deliveries are then discarded
        // and callers see their calls abandoned.
        let spawned = thread::Builder::new()
            .name("codex-sim".into())
            .spawn(move || {
                for d in rx {
                    for (code, msg) in &d.notes {
                        // SAFETY: the callback is one of the bridge's routers, which accept
                        // any user_data and only read msg for len bytes.
                        unsafe {
                            (d.callback)(
                                *code,
                                msg.as_ptr().cast::<c_char>(),
                                msg.len(),
                                d.user_data as *mut c_void,
                            )
                        };
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn simulator worker");
        }
        Self {
            state: Mutex::new(SimState::default()),
            worker: Mutex::new(tx),
        }
    }

    /// Fail the call to `call` made after `after` further successful invocations, with
    /// a terminal `RET_ERR` carrying `message`.
    pub fn fail_call(&self, call: &'static str, after: usize, message: &str) {
        lock(&self.state).schedule(call, after, FaultAction::Fail(message.to_owned()));
    }

    /// Make that invocation return `code` immediately, without any callback.
    pub fn reject_call(&self, call: &'static str, after: usize, code: c_int) {
        lock(&self.state).schedule(call, after, FaultAction::Reject(code));
    }

    /// Deliver that invocation's terminal notification twice.
    pub fn duplicate_terminal(&self, call: &'static str, after: usize) {
        lock(&self.state).schedule(call, after, FaultAction::Duplicate);
    }

    /// Invocations of `call` so far, rejected ones included.
    pub fn calls(&self, call: &str) -> usize {
        lock(&self.state).calls.get(call).copied().unwrap_or(0)
    }

    /// Configuration JSON of the most recent creation call.
    pub fn last_config(&self) -> Option<String> {
        lock(&self.state).last_config.clone()
    }

    /// Raise an event on `node`. Dropped if no event callback is registered.
    pub fn emit_event(&self, node: NodePtr, code: c_int, message: &[u8]) {
        let target = lock(&self.state)
            .nodes
            .get(&(node.as_ptr() as usize))
            .and_then(|n| n.events);
        match target {
            Some((callback, user_data)) => self.deliver(Delivery {
                callback,
                user_data,
                notes: vec![(code, message.to_vec())],
            }),
            None => tracing::debug!("sim: no event callback registered"),
        }
    }

    fn deliver(&self, delivery: Delivery) {
        if lock(&self.worker).send(delivery).is_err() {
            tracing::error!("sim: worker gone, notification discarded");
        }
    }
}

fn text(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn c_str(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

fn content_id(data: &[u8]) -> String {
    format!("zDvZ{:x}", Sha256::digest(data))
}

fn guess_mimetype(filename: Option<&str>) -> &'static str {
    match filename.and_then(|f| f.rsplit_once('.')).map(|(_, ext)| ext) {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

fn manifest(cid: &str, stored: &Stored) -> serde_json::Value {
    json!({
        "cid": cid,
        "treeCid": cid,
        "datasetSize": stored.data.len(),
        "blockSize": DEFAULT_CHUNK_SIZE,
        "filename": stored.filename,
        "mimetype": stored
            .mimetype
            .as_deref()
            .unwrap_or_else(|| guess_mimetype(stored.filename.as_deref())),
        "protected": false,
    })
}

/// Terminal outcome plus the progress chunks preceding it.
type Reply = (Vec<Vec<u8>>, Result<Vec<u8>, String>);

fn ok(payload: Vec<u8>) -> Reply {
    (Vec::new(), Ok(payload))
}

fn err(message: impl Into<String>) -> Reply {
    (Vec::new(), Err(message.into()))
}

fn handle(node: &mut SimNode, key: usize, request: &Request<'_>) -> Reply {
    match *request {
        Request::Version => ok(text(SIM_VERSION)),
        Request::Revision => ok(text(SIM_REVISION)),
        Request::Repo => ok(text("./codex-data")),
        Request::Spr => ok(text(SIM_SPR)),
        Request::PeerId => ok(text(&format!("16Uiu2HAmSim{key}"))),
        Request::Debug => ok(json!({
            "id": format!("16Uiu2HAmSim{key}"),
            "addrs": ["/ip4/127.0.0.1/tcp/8070"],
            "spr": SIM_SPR,
            "running": node.running,
        })
        .to_string()
        .into_bytes()),
        Request::LogLevel { level } => match c_str(level).as_str() {
            "TRACE" | "DEBUG" | "INFO" | "NOTICE" | "WARN" | "ERROR" | "FATAL" => ok(Vec::new()),
            other => err(format!("invalid log level: {other}")),
        },
        Request::Connect { peer_id, .. } => {
            if peer_id.to_bytes().is_empty() {
                err("peer id is empty")
            } else {
                ok(Vec::new())
            }
        }
        Request::PeerDebug { peer_id } => {
            ok(json!({ "peerId": c_str(peer_id), "addresses": [] })
                .to_string()
                .into_bytes())
        }
        Request::UploadInit { mimetype, filename } => {
            let id = uuid::Uuid::new_v4().to_string();
            node.uploads.insert(
                id.clone(),
                Upload {
                    filename: filename.map(c_str),
                    mimetype: mimetype.map(c_str),
                    data: Vec::new(),
                },
            );
            ok(id.into_bytes())
        }
        Request::UploadChunk { session_id, chunk } => {
            match node.uploads.get_mut(&c_str(session_id)) {
                Some(upload) => {
                    upload.data.extend_from_slice(chunk);
                    ok(Vec::new())
                }
                None => err("upload session not found"),
            }
        }
        Request::UploadFinalize { session_id } => match node.uploads.remove(&c_str(session_id)) {
            Some(upload) => {
                let cid = content_id(&upload.data);
                node.store.insert(
                    cid.clone(),
                    Stored {
                        data: upload.data,
                        filename: upload.filename,
                        mimetype: upload.mimetype,
                    },
                );
                ok(cid.into_bytes())
            }
            None => err("upload session not found"),
        },
        Request::UploadCancel { session_id } => match node.uploads.remove(&c_str(session_id)) {
            Some(_) => ok(Vec::new()),
            None => err("upload session not found"),
        },
        Request::DownloadInit {
            cid, chunk_size, ..
        } => {
            let cid = c_str(cid);
            if !node.store.contains_key(&cid) {
                return err(format!("content not found: {cid}"));
            }
            node.downloads.insert(
                cid,
                Download {
                    offset: 0,
                    chunk_size: effective_chunk_size(Some(chunk_size)),
                },
            );
            ok(Vec::new())
        }
        Request::DownloadChunk { cid } => {
            let cid = c_str(cid);
            let (Some(download), Some(stored)) = (node.downloads.get_mut(&cid), node.store.get(&cid))
            else {
                return err("download session not found");
            };
            let end = (download.offset + download.chunk_size).min(stored.data.len());
            let chunk = stored.data[download.offset..end].to_vec();
            download.offset = end;
            if chunk.is_empty() {
                ok(Vec::new())
            } else {
                (vec![chunk], Ok(Vec::new()))
            }
        }
        Request::DownloadStream {
            cid,
            chunk_size,
            filepath,
            ..
        } => {
            let cid = c_str(cid);
            let Some(stored) = node.store.get(&cid) else {
                return err(format!("content not found: {cid}"));
            };
            if let Some(path) = filepath {
                if let Err(e) = std::fs::write(c_str(path), &stored.data) {
                    return err(e.to_string());
                }
            }
            let chunks = stored
                .data
                .chunks(effective_chunk_size(Some(chunk_size)))
                .map(<[u8]>::to_vec)
                .collect();
            (chunks, Ok(Vec::new()))
        }
        Request::DownloadCancel { cid } => match node.downloads.remove(&c_str(cid)) {
            Some(_) => ok(Vec::new()),
            None => err("download session not found"),
        },
        Request::DownloadManifest { cid } | Request::StorageFetch { cid } => {
            let cid = c_str(cid);
            match node.store.get(&cid) {
                Some(stored) => ok(manifest(&cid, stored).to_string().into_bytes()),
                None => err(format!("content not found: {cid}")),
            }
        }
        Request::StorageList => {
            let all: Vec<_> = node.store.iter().map(|(cid, s)| manifest(cid, s)).collect();
            ok(serde_json::Value::from(all).to_string().into_bytes())
        }
        Request::StorageSpace => {
            let used: usize = node.store.values().map(|s| s.data.len()).sum();
            ok(json!({
                "totalBlocks": node.store.len(),
                "quotaMaxBytes": 20u64 * 1024 * 1024 * 1024,
                "quotaUsedBytes": used,
                "quotaReservedBytes": 0,
            })
            .to_string()
            .into_bytes())
        }
        Request::StorageDelete { cid } => {
            node.store.remove(&c_str(cid));
            ok(Vec::new())
        }
        Request::StorageExists { cid } => {
            ok(node.store.contains_key(&c_str(cid)).to_string().into_bytes())
        }
        Request::Start => {
            node.running = true;
            ok(Vec::new())
        }
        Request::Stop => {
            node.running = false;
            ok(Vec::new())
        }
        Request::Destroy => ok(Vec::new()),
    }
}

impl NativeApi for SimNative {
    fn create(
        &self,
        config_json: &CStr,
        callback: CodexCallback,
        user_data: *mut c_void,
    ) -> *mut c_void {
        let mut state = lock(&self.state);
        state.last_config = Some(c_str(config_json));
        let fault = state.record("codex_new");
        let (ctx, note) = match fault {
            Some(FaultAction::Fail(msg)) => (std::ptr::null_mut(), (RET_ERR, msg.into_bytes())),
            _ => {
                if let Err(e) = serde_json::from_str::<serde_json::Value>(&c_str(config_json)) {
                    (std::ptr::null_mut(), (RET_ERR, e.to_string().into_bytes()))
                } else {
                    state.next_node += 1;
                    let key = state.next_node;
                    state.nodes.insert(key, SimNode::default());
                    (key as *mut c_void, (RET_OK, Vec::new()))
                }
            }
        };
        drop(state);
        self.deliver(Delivery {
            callback,
            user_data: user_data as usize,
            notes: vec![note],
        });
        ctx
    }

    fn invoke(
        &self,
        node: NodePtr,
        request: &Request<'_>,
        callback: CodexCallback,
        user_data: *mut c_void,
    ) -> c_int {
        let name = request.name();
        let key = node.as_ptr() as usize;
        let mut state = lock(&self.state);
        let fault = state.record(name);
        let duplicate = matches!(fault, Some(FaultAction::Duplicate));
        let (progress, terminal) = match fault {
            Some(FaultAction::Reject(code)) => {
                tracing::debug!(call = name, code, "sim: rejecting call");
                return code;
            }
            Some(FaultAction::Fail(msg)) => err(msg),
            _ => match state.nodes.get_mut(&key) {
                Some(n) => handle(n, key, request),
                None => err("unknown node context"),
            },
        };
        if matches!(request, Request::Destroy) && terminal.is_ok() {
            state.nodes.remove(&key);
        }
        drop(state);

        let mut notes: Vec<_> = progress.into_iter().map(|c| (RET_PROGRESS, c)).collect();
        let terminal = match terminal {
            Ok(payload) => (RET_OK, payload),
            Err(msg) => (RET_ERR, msg.into_bytes()),
        };
        if duplicate {
            notes.push(terminal.clone());
        }
        notes.push(terminal);
        self.deliver(Delivery {
            callback,
            user_data: user_data as usize,
            notes,
        });
        RET_OK
    }

    fn set_event_callback(&self, node: NodePtr, callback: CodexCallback, user_data: *mut c_void) {
        let mut state = lock(&self.state);
        state.record("codex_set_event_callback");
        if let Some(n) = state.nodes.get_mut(&(node.as_ptr() as usize)) {
            n.events = Some((callback, user_data as usize));
        }
    }
}

/// Install a tracing subscriber writing through the test harness. Idempotent.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, Token};
    use crate::router::{route, CallbackStatus, Routed};
    use crate::{Node, NodeConfig};
    use std::ffi::CString;
    use std::sync::{Arc, OnceLock};
    use std::time::{Duration, Instant};

    static DUPLICATE_REGISTRY: OnceLock<Registry> = OnceLock::new();
    static DUPLICATE_ROUTED: Mutex<Vec<Routed>> = Mutex::new(Vec::new());

    /// Routes against a private registry and records what each notification did.
    unsafe extern "C" fn recording_callback(
        ret: c_int,
        msg: *const c_char,
        len: usize,
        user_data: *mut c_void,
    ) {
        let payload = if msg.is_null() || len == 0 {
            None
        } else {
            Some(unsafe { std::slice::from_raw_parts(msg.cast::<u8>(), len) })
        };
        let routed = route(
            DUPLICATE_REGISTRY.get_or_init(Registry::new),
            CallbackStatus::from_code(ret),
            len,
            payload,
            Token::from_user_data(user_data),
        );
        lock(&DUPLICATE_ROUTED).push(routed);
    }

    #[test]
    fn duplicate_terminal_is_dropped_by_the_router() {
        init_test_tracing();
        let registry = DUPLICATE_REGISTRY.get_or_init(Registry::new);
        let sim = SimNative::new();

        let (token, rx) = registry.allocate(None);
        let config = CString::new("{}").unwrap();
        let ctx = sim.create(&config, recording_callback, token.as_user_data());
        rx.blocking_recv().unwrap().unwrap();
        let node = NodePtr::from_raw(ctx);

        sim.duplicate_terminal("codex_version", 0);
        let (version, version_rx) = registry.allocate(None);
        assert_eq!(
            sim.invoke(node, &Request::Version, recording_callback, version.as_user_data()),
            RET_OK
        );
        assert_eq!(version_rx.blocking_recv().unwrap().unwrap(), SIM_VERSION.as_bytes());

        // Deliveries are FIFO, so the duplicate lands before the next call's terminal.
        let (revision, revision_rx) = registry.allocate(None);
        sim.invoke(node, &Request::Revision, recording_callback, revision.as_user_data());
        assert_eq!(revision_rx.blocking_recv().unwrap().unwrap(), SIM_REVISION.as_bytes());

        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&DUPLICATE_ROUTED).len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            *lock(&DUPLICATE_ROUTED),
            vec![
                Routed::Completed,
                Routed::Completed,
                Routed::Dropped,
                Routed::Completed
            ]
        );
        assert!(!registry.contains(version));
        assert!(registry.is_empty());
        assert_eq!(sim.calls("codex_version"), 1);
    }

    #[test]
    fn duplicate_terminal_does_not_disturb_later_calls() {
        init_test_tracing();
        let sim = Arc::new(SimNative::new());
        let node = Node::new(sim.clone(), &NodeConfig::default()).unwrap();
        sim.duplicate_terminal("codex_version", 0);
        assert_eq!(node.version().unwrap(), SIM_VERSION);
        for _ in 0..10 {
            assert_eq!(node.revision().unwrap(), SIM_REVISION);
            assert_eq!(node.version().unwrap(), SIM_VERSION);
        }
    }

    #[test]
    fn faults_fire_once_at_their_index() {
        let sim = SimNative::new();
        sim.fail_call("codex_peer_id", 2, "third time unlucky");
        let mut state = lock(&sim.state);
        assert!(state.record("codex_peer_id").is_none());
        assert!(state.record("codex_peer_id").is_none());
        assert!(matches!(
            state.record("codex_peer_id"),
            Some(FaultAction::Fail(_))
        ));
        assert!(state.record("codex_peer_id").is_none());
        drop(state);
        assert_eq!(sim.calls("codex_peer_id"), 4);
    }

    #[test]
    fn content_ids_are_stable() {
        assert_eq!(content_id(b"abc"), content_id(b"abc"));
        assert_ne!(content_id(b"abc"), content_id(b"abd"));
        assert!(content_id(b"").starts_with("zDvZ"));
    }

    #[test]
    fn concurrent_calls_on_one_node() {
        init_test_tracing();
        let sim = Arc::new(SimNative::new());
        let node = Arc::new(Node::new(sim.clone(), &NodeConfig::default()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        node.peer_id().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sim.calls("codex_peer_id"), 400);
    }
}
