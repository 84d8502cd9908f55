//! Chunked transfer sessions: upload (init → chunk* → finalize | cancel) and download
//! (init → chunk* | stream, cancel), with byte accounting and progress percentages.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::native::Request;
use crate::node::Node;
use crate::registry::lock;

/// Chunk size used when none (or zero) is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size actually used for a session.
pub fn effective_chunk_size(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_CHUNK_SIZE,
        Some(n) => n,
    }
}

/// Session identifier issued by the native component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

/// Content identifier (CID) assigned by the native component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId(String);

macro_rules! string_id {
    ($t:ty) => {
        impl $t {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $t {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ContentId);

/// Session lifecycle. Anything but `Open` is terminal, except that `Failed` may still
/// be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalized,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Upload,
    Download,
}

#[derive(Debug)]
pub(crate) struct SessionEntry {
    state: SessionState,
    chunk_size: usize,
    bytes: u64,
}

impl SessionEntry {
    fn ensure_open(&self, id: &str) -> Result<()> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(BridgeError::InvalidSessionState {
                id: id.to_owned(),
                state: self.state,
            })
        }
    }
}

type SessionSlot = Arc<Mutex<SessionEntry>>;
type SessionKey = (SessionKind, String);

/// Finalized or cancelled sessions kept visible before eviction, oldest first.
const RETAINED_TERMINAL: usize = 64;

#[derive(Debug, Default)]
struct TableInner {
    entries: HashMap<SessionKey, SessionSlot>,
    retired: VecDeque<SessionKey>,
}

/// Per-node session table. Each entry has its own lock, held across the native call,
/// so steps of one session are serialized while different sessions run concurrently.
///
/// Only the last [`RETAINED_TERMINAL`] finalized or cancelled sessions stay in the
/// table; older ones are evicted and report `UnknownSession`. Failed sessions stay
/// until cancelled. Lock order is entry, then table.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    inner: Mutex<TableInner>,
}

impl SessionTable {
    fn open(&self, kind: SessionKind, id: &str, chunk_size: usize) -> SessionSlot {
        let entry = SessionEntry {
            state: SessionState::Open,
            chunk_size,
            bytes: 0,
        };
        let slot = Arc::new(Mutex::new(entry));
        let key = (kind, id.to_owned());
        let mut inner = lock(&self.inner);
        // A reopened key (same CID downloaded again) must not be evicted as the old one.
        inner.retired.retain(|k| k != &key);
        inner.entries.insert(key, slot.clone());
        slot
    }

    fn get(&self, kind: SessionKind, id: &str) -> Result<SessionSlot> {
        lock(&self.inner)
            .entries
            .get(&(kind, id.to_owned()))
            .cloned()
            .ok_or_else(|| BridgeError::UnknownSession(id.to_owned()))
    }

    fn state(&self, kind: SessionKind, id: &str) -> Option<SessionState> {
        let slot = self.get(kind, id).ok()?;
        let state = lock(&slot).state;
        Some(state)
    }

    /// Mark a finalized or cancelled session for eviction.
    fn retire(&self, kind: SessionKind, id: &str) {
        let key = (kind, id.to_owned());
        let mut inner = lock(&self.inner);
        if inner.retired.contains(&key) {
            return;
        }
        inner.retired.push_back(key);
        while inner.retired.len() > RETAINED_TERMINAL {
            if let Some(old) = inner.retired.pop_front() {
                inner.entries.remove(&old);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

/// One progress report of a chunked transfer.
///
/// `percent` is `min(100, total_bytes / expected * 100)` when the expected size is
/// known, and always `0.0` when it is not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub chunk_bytes: usize,
    pub total_bytes: u64,
    pub percent: f64,
}

/// Completion percentage; `0.0` for an unknown expected size.
pub fn progress_percent(total: u64, expected: Option<u64>) -> f64 {
    match expected {
        None => 0.0,
        Some(0) => 100.0,
        Some(expected) => (total as f64 / expected as f64 * 100.0).min(100.0),
    }
}

#[derive(Debug)]
struct ProgressTracker {
    total: u64,
    expected: Option<u64>,
}

impl ProgressTracker {
    fn new(expected: Option<u64>) -> Self {
        Self { total: 0, expected }
    }

    fn record(&mut self, chunk_bytes: usize) -> TransferProgress {
        self.total += chunk_bytes as u64;
        TransferProgress {
            chunk_bytes,
            total_bytes: self.total,
            percent: progress_percent(self.total, self.expected),
        }
    }
}

/// Upload session parameters.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// File name recorded in the manifest; the library also guesses the mimetype from it.
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    /// Chunk size in bytes; `None` or `Some(0)` means [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: Option<usize>,
}

/// Download session parameters.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Chunk size in bytes; `None` or `Some(0)` means [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: Option<usize>,
    /// Only serve the content from the local store; never fetch from the network.
    pub local: bool,
    /// Fetch the manifest first to learn the dataset size (enables percentages).
    pub fetch_manifest: bool,
    /// Let the native component also write the content to this path.
    pub filepath: Option<String>,
}

/// Dataset manifest. Only the fields the bridge uses are decoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub dataset_size: u64,
    #[serde(default)]
    pub block_size: Option<u64>,
    #[serde(default)]
    pub tree_cid: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
}

impl Manifest {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Open upload session. Steps take `&mut self`; `finalize` and `cancel` consume it.
#[derive(Debug)]
pub struct UploadSession<'n> {
    node: &'n Node,
    id: SessionId,
    chunk_size: usize,
    slot: SessionSlot,
}

impl UploadSession<'_> {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn state(&self) -> SessionState {
        lock(&self.slot).state
    }

    pub fn bytes_sent(&self) -> u64 {
        lock(&self.slot).bytes
    }

    /// Send one chunk. On failure the session becomes `Failed` and must be cancelled.
    pub fn chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.node.upload_chunk(&self.id, bytes)
    }

    /// Finalize the upload. On failure the session is cancelled and the finalize error
    /// returned, combined with the cancel error if that fails too.
    pub fn finalize(self) -> Result<ContentId> {
        match self.node.upload_finalize(&self.id) {
            Ok(cid) => Ok(cid),
            Err(e) => Err(self.abort(e)),
        }
    }

    pub fn cancel(self) -> Result<()> {
        self.node.upload_cancel(&self.id)
    }

    /// Cancel after `error`, reporting both errors if the cancel fails too.
    fn abort(self, error: BridgeError) -> BridgeError {
        abort_with(self.cancel(), error)
    }
}

/// Open download session, keyed by the content id.
#[derive(Debug)]
pub struct DownloadSession<'n> {
    node: &'n Node,
    cid: ContentId,
    chunk_size: usize,
    slot: SessionSlot,
}

impl DownloadSession<'_> {
    pub fn cid(&self) -> &ContentId {
        &self.cid
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn state(&self) -> SessionState {
        lock(&self.slot).state
    }

    pub fn bytes_received(&self) -> u64 {
        lock(&self.slot).bytes
    }

    /// Receive the next chunk; `None` once the content is exhausted (session `Finalized`).
    pub fn chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.node.download_chunk(&self.cid)
    }

    pub fn cancel(self) -> Result<()> {
        self.node.download_cancel(&self.cid)
    }

    fn abort(self, error: BridgeError) -> BridgeError {
        abort_with(self.cancel(), error)
    }
}

fn abort_with(cancelled: Result<()>, error: BridgeError) -> BridgeError {
    match cancelled {
        Ok(()) => error,
        Err(cancel_error) => {
            tracing::warn!(%error, %cancel_error, "cancel after session failure failed");
            BridgeError::SessionAborted {
                error: Box::new(error),
                cancel_error: Box::new(cancel_error),
            }
        }
    }
}

/// Fill `buf` from `reader` until full or end of stream. Returns the bytes read.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Node {
    pub fn upload_init(&self, options: &UploadOptions) -> Result<UploadSession<'_>> {
        let chunk_size = effective_chunk_size(options.chunk_size);
        let filename = options.filename.as_deref().map(CString::new).transpose()?;
        let mimetype = options.mimetype.as_deref().map(CString::new).transpose()?;
        let id = SessionId(self.request_string(Request::UploadInit {
            mimetype: mimetype.as_deref(),
            filename: filename.as_deref(),
        })?);
        let slot = self
            .sessions
            .open(SessionKind::Upload, id.as_str(), chunk_size);
        tracing::debug!(session = %id, chunk_size, "upload session opened");
        Ok(UploadSession {
            node: self,
            id,
            chunk_size,
            slot,
        })
    }

    pub fn upload_chunk(&self, id: &SessionId, chunk: &[u8]) -> Result<()> {
        let slot = self.sessions.get(SessionKind::Upload, id.as_str())?;
        let mut entry = lock(&slot);
        entry.ensure_open(id.as_str())?;
        let session_id = CString::new(id.as_str())?;
        match self.request(Request::UploadChunk {
            session_id: &session_id,
            chunk,
        }) {
            Ok(_) => {
                entry.bytes += chunk.len() as u64;
                tracing::trace!(session = %id, len = chunk.len(), total = entry.bytes, "chunk sent");
                Ok(())
            }
            Err(e) => {
                entry.state = SessionState::Failed;
                tracing::warn!(session = %id, error = %e, "upload chunk failed");
                Err(e)
            }
        }
    }

    pub fn upload_finalize(&self, id: &SessionId) -> Result<ContentId> {
        let slot = self.sessions.get(SessionKind::Upload, id.as_str())?;
        let mut entry = lock(&slot);
        entry.ensure_open(id.as_str())?;
        let session_id = CString::new(id.as_str())?;
        match self.request_string(Request::UploadFinalize {
            session_id: &session_id,
        }) {
            Ok(cid) => {
                entry.state = SessionState::Finalized;
                self.sessions.retire(SessionKind::Upload, id.as_str());
                tracing::info!(session = %id, %cid, bytes = entry.bytes, "upload finalized");
                Ok(ContentId(cid))
            }
            Err(e) => {
                entry.state = SessionState::Failed;
                tracing::warn!(session = %id, error = %e, "upload finalize failed");
                Err(e)
            }
        }
    }

    /// Cancel an upload. Cancelling an already cancelled session is a no-op until the
    /// session is evicted, after which it is `UnknownSession`.
    pub fn upload_cancel(&self, id: &SessionId) -> Result<()> {
        self.cancel_session(SessionKind::Upload, id.as_str())
    }

    pub fn upload_state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.state(SessionKind::Upload, id.as_str())
    }

    /// Upload everything `reader` yields, one `chunk_size` buffer per chunk call.
    ///
    /// With `expected_size` the reported percentages are meaningful; without it they are
    /// always `0.0`. On a read, chunk or finalize error the session is cancelled and the
    /// original error returned.
    pub fn upload_reader<R, P>(
        &self,
        mut reader: R,
        options: &UploadOptions,
        expected_size: Option<u64>,
        mut on_progress: P,
    ) -> Result<ContentId>
    where
        R: Read,
        P: FnMut(TransferProgress),
    {
        let mut session = self.upload_init(options)?;
        let mut buf = vec![0u8; session.chunk_size()];
        let mut tracker = ProgressTracker::new(expected_size);
        loop {
            let n = match read_chunk(&mut reader, &mut buf) {
                Ok(n) => n,
                Err(e) => return Err(session.abort(BridgeError::Io(e))),
            };
            if n == 0 {
                break;
            }
            if let Err(e) = session.chunk(&buf[..n]) {
                return Err(session.abort(e));
            }
            on_progress(tracker.record(n));
        }
        session.finalize()
    }

    /// Upload a file; its size is probed up front so progress carries percentages.
    pub fn upload_file<P>(
        &self,
        path: impl AsRef<Path>,
        options: &UploadOptions,
        on_progress: P,
    ) -> Result<ContentId>
    where
        P: FnMut(TransferProgress),
    {
        let path = path.as_ref();
        let file = File::open(path)?;
        let expected = file.metadata()?.len();
        let mut options = options.clone();
        if options.filename.is_none() {
            options.filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        self.upload_reader(file, &options, Some(expected), on_progress)
    }

    pub fn download_init(
        &self,
        cid: &ContentId,
        options: &DownloadOptions,
    ) -> Result<DownloadSession<'_>> {
        let chunk_size = effective_chunk_size(options.chunk_size);
        let c_cid = CString::new(cid.as_str())?;
        self.request(Request::DownloadInit {
            cid: &c_cid,
            chunk_size,
            local: options.local,
        })?;
        let slot = self
            .sessions
            .open(SessionKind::Download, cid.as_str(), chunk_size);
        tracing::debug!(%cid, chunk_size, local = options.local, "download session opened");
        Ok(DownloadSession {
            node: self,
            cid: cid.clone(),
            chunk_size,
            slot,
        })
    }

    /// Receive one chunk of an open download. `None` marks the end of the content.
    pub fn download_chunk(&self, cid: &ContentId) -> Result<Option<Vec<u8>>> {
        let slot = self.sessions.get(SessionKind::Download, cid.as_str())?;
        let mut entry = lock(&slot);
        entry.ensure_open(cid.as_str())?;
        let c_cid = CString::new(cid.as_str())?;
        let mut data = Vec::new();
        let received = self.request_streaming(Request::DownloadChunk { cid: &c_cid }, |chunk| {
            data.extend_from_slice(chunk);
            Ok(())
        });
        match received {
            Ok(_) if data.is_empty() => {
                entry.state = SessionState::Finalized;
                self.sessions.retire(SessionKind::Download, cid.as_str());
                tracing::debug!(%cid, bytes = entry.bytes, "download exhausted");
                Ok(None)
            }
            Ok(_) => {
                entry.bytes += data.len() as u64;
                Ok(Some(data))
            }
            Err(e) => {
                entry.state = SessionState::Failed;
                tracing::warn!(%cid, error = %e, "download chunk failed");
                Err(e)
            }
        }
    }

    /// Cancel a download. Cancelling an already cancelled session is a no-op.
    pub fn download_cancel(&self, cid: &ContentId) -> Result<()> {
        self.cancel_session(SessionKind::Download, cid.as_str())
    }

    pub fn download_state(&self, cid: &ContentId) -> Option<SessionState> {
        self.sessions.state(SessionKind::Download, cid.as_str())
    }

    /// Raw manifest JSON of `cid`.
    pub fn download_manifest(&self, cid: &ContentId) -> Result<String> {
        let c_cid = CString::new(cid.as_str())?;
        self.request_string(Request::DownloadManifest { cid: &c_cid })
    }

    /// Download `cid` into `sink`, driven by the native push loop. Returns the byte count.
    ///
    /// With `options.fetch_manifest` the manifest is fetched first so progress carries
    /// percentages; otherwise percentages are `0.0`. On a sink or stream error the session
    /// is cancelled and the original error returned.
    pub fn download_stream<W, P>(
        &self,
        cid: &ContentId,
        sink: &mut W,
        options: &DownloadOptions,
        on_progress: P,
    ) -> Result<u64>
    where
        W: Write,
        P: FnMut(TransferProgress),
    {
        let expected = if options.fetch_manifest {
            Some(Manifest::parse(&self.download_manifest(cid)?)?.dataset_size)
        } else {
            None
        };
        let session = self.download_init(cid, options)?;
        match self.stream_into(&session, sink, options, expected, on_progress) {
            Ok(total) => Ok(total),
            Err(e) => Err(session.abort(e)),
        }
    }

    fn stream_into<W, P>(
        &self,
        session: &DownloadSession<'_>,
        sink: &mut W,
        options: &DownloadOptions,
        expected: Option<u64>,
        mut on_progress: P,
    ) -> Result<u64>
    where
        W: Write,
        P: FnMut(TransferProgress),
    {
        let cid = session.cid();
        let mut entry = lock(&session.slot);
        entry.ensure_open(cid.as_str())?;
        let c_cid = CString::new(cid.as_str())?;
        let filepath = options.filepath.as_deref().map(CString::new).transpose()?;
        let mut tracker = ProgressTracker::new(expected);
        let streamed = self.request_streaming(
            Request::DownloadStream {
                cid: &c_cid,
                chunk_size: entry.chunk_size,
                local: options.local,
                filepath: filepath.as_deref(),
            },
            |chunk| {
                sink.write_all(chunk)?;
                on_progress(tracker.record(chunk.len()));
                Ok(())
            },
        );
        entry.bytes = tracker.total;
        match streamed.and_then(|_| sink.flush().map_err(BridgeError::from)) {
            Ok(()) => {
                entry.state = SessionState::Finalized;
                self.sessions.retire(SessionKind::Download, cid.as_str());
                tracing::info!(%cid, bytes = tracker.total, "download complete");
                Ok(tracker.total)
            }
            Err(e) => {
                entry.state = SessionState::Failed;
                tracing::warn!(%cid, error = %e, "download stream failed");
                Err(e)
            }
        }
    }

    fn cancel_session(&self, kind: SessionKind, id: &str) -> Result<()> {
        let slot = self.sessions.get(kind, id)?;
        let mut entry = lock(&slot);
        match entry.state {
            SessionState::Cancelled => {
                tracing::debug!(session = id, "session already cancelled");
                return Ok(());
            }
            SessionState::Finalized => {
                return Err(BridgeError::InvalidSessionState {
                    id: id.to_owned(),
                    state: entry.state,
                })
            }
            SessionState::Open | SessionState::Failed => {}
        }
        let c_id = CString::new(id)?;
        let request = match kind {
            SessionKind::Upload => Request::UploadCancel { session_id: &c_id },
            SessionKind::Download => Request::DownloadCancel { cid: &c_id },
        };
        match self.request(request) {
            Ok(_) => {
                entry.state = SessionState::Cancelled;
                self.sessions.retire(kind, id);
                tracing::debug!(session = id, ?kind, "session cancelled");
                Ok(())
            }
            Err(e) => {
                entry.state = SessionState::Failed;
                Err(e)
            }
        }
    }
}
