//! The narrow call interface to the native component.
//!
//! [`NativeApi`] is the seam between the bridge and whatever implements the libcodex
//! ABI: the linked library ([`crate::ffi::LibCodex`]) or the in-process simulator
//! (`crate::sim::SimNative`).

use std::ffi::{c_int, c_void, CStr, CString};

use crate::ffi::CodexCallback;

/// Opaque native context pointer returned by the creation call. Never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodePtr(*mut c_void);

// SAFETY: the pointer is an opaque handle owned by the native component, which accepts
// requests from any thread and serializes them internally. The bridge never dereferences it.
unsafe impl Send for NodePtr {}
// SAFETY: see above; sharing the handle only shares the opaque address.
unsafe impl Sync for NodePtr {}

impl NodePtr {
    pub(crate) fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// One native request. Borrowed arguments stay alive until the terminal callback,
/// since the façade blocks (or holds the owning strings) until then.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    Version,
    Revision,
    Repo,
    Debug,
    Spr,
    PeerId,
    LogLevel {
        level: &'a CStr,
    },
    Connect {
        peer_id: &'a CStr,
        addrs: &'a [CString],
    },
    PeerDebug {
        peer_id: &'a CStr,
    },
    /// Chunk size stays on the bridge side; the library accepts chunks of any length.
    UploadInit {
        mimetype: Option<&'a CStr>,
        filename: Option<&'a CStr>,
    },
    UploadChunk {
        session_id: &'a CStr,
        chunk: &'a [u8],
    },
    UploadFinalize {
        session_id: &'a CStr,
    },
    UploadCancel {
        session_id: &'a CStr,
    },
    DownloadInit {
        cid: &'a CStr,
        chunk_size: usize,
        local: bool,
    },
    DownloadChunk {
        cid: &'a CStr,
    },
    DownloadStream {
        cid: &'a CStr,
        chunk_size: usize,
        local: bool,
        filepath: Option<&'a CStr>,
    },
    DownloadCancel {
        cid: &'a CStr,
    },
    DownloadManifest {
        cid: &'a CStr,
    },
    StorageList,
    StorageSpace,
    StorageDelete {
        cid: &'a CStr,
    },
    StorageFetch {
        cid: &'a CStr,
    },
    StorageExists {
        cid: &'a CStr,
    },
    Start,
    Stop,
    Destroy,
}

impl Request<'_> {
    /// Native entry point name, used in logs and `Rejected` errors.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Version => "codex_version",
            Request::Revision => "codex_revision",
            Request::Repo => "codex_repo",
            Request::Debug => "codex_debug",
            Request::Spr => "codex_spr",
            Request::PeerId => "codex_peer_id",
            Request::LogLevel { .. } => "codex_log_level",
            Request::Connect { .. } => "codex_connect",
            Request::PeerDebug { .. } => "codex_peer_debug",
            Request::UploadInit { .. } => "codex_upload_init",
            Request::UploadChunk { .. } => "codex_upload_chunk",
            Request::UploadFinalize { .. } => "codex_upload_finalize",
            Request::UploadCancel { .. } => "codex_upload_cancel",
            Request::DownloadInit { .. } => "codex_download_init",
            Request::DownloadChunk { .. } => "codex_download_chunk",
            Request::DownloadStream { .. } => "codex_download_stream",
            Request::DownloadCancel { .. } => "codex_download_cancel",
            Request::DownloadManifest { .. } => "codex_download_manifest",
            Request::StorageList => "codex_storage_list",
            Request::StorageSpace => "codex_storage_space",
            Request::StorageDelete { .. } => "codex_storage_delete",
            Request::StorageFetch { .. } => "codex_storage_fetch",
            Request::StorageExists { .. } => "codex_storage_exists",
            Request::Start => "codex_start",
            Request::Stop => "codex_stop",
            Request::Destroy => "codex_destroy",
        }
    }

    /// Whether the entry point is declared by the base `libcodex.h`. The download and
    /// storage calls exist only in libraries built with the storage API.
    pub fn in_base_abi(&self) -> bool {
        !matches!(
            self,
            Request::DownloadInit { .. }
                | Request::DownloadChunk { .. }
                | Request::DownloadStream { .. }
                | Request::DownloadCancel { .. }
                | Request::DownloadManifest { .. }
                | Request::StorageList
                | Request::StorageSpace
                | Request::StorageDelete { .. }
                | Request::StorageFetch { .. }
                | Request::StorageExists { .. }
        )
    }
}

/// Entry points of one native component implementation.
///
/// Implementations must invoke `callback` with `user_data` unchanged, from any thread,
/// delivering progress notifications strictly before the single terminal one.
pub trait NativeApi: Send + Sync {
    /// Creation call. Returns the node context (may be null on failure) and reports the
    /// outcome through `callback`.
    fn create(&self, config_json: &CStr, callback: CodexCallback, user_data: *mut c_void)
        -> *mut c_void;

    /// Issue one request against `node`. A non-zero return means the call was rejected
    /// and `callback` will not be invoked for it.
    fn invoke(
        &self,
        node: NodePtr,
        request: &Request<'_>,
        callback: CodexCallback,
        user_data: *mut c_void,
    ) -> c_int;

    /// Register the shared event callback for `node`.
    fn set_event_callback(&self, node: NodePtr, callback: CodexCallback, user_data: *mut c_void);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_names_match_entry_points() {
        let cid = CString::new("zDv").unwrap();
        assert_eq!(Request::Version.name(), "codex_version");
        assert_eq!(
            Request::DownloadStream {
                cid: &cid,
                chunk_size: 0,
                local: false,
                filepath: None,
            }
            .name(),
            "codex_download_stream"
        );
        assert_eq!(Request::Destroy.name(), "codex_destroy");
    }

    #[test]
    fn base_abi_matches_the_header() {
        let s = CString::new("x").unwrap();
        let addrs = [CString::new("/ip4/127.0.0.1/tcp/8070").unwrap()];
        let base = [
            Request::Version,
            Request::Revision,
            Request::Repo,
            Request::Debug,
            Request::Spr,
            Request::PeerId,
            Request::LogLevel { level: &s },
            Request::Connect {
                peer_id: &s,
                addrs: &addrs,
            },
            Request::PeerDebug { peer_id: &s },
            Request::UploadInit {
                mimetype: Some(&s),
                filename: None,
            },
            Request::UploadChunk {
                session_id: &s,
                chunk: b"abc",
            },
            Request::UploadFinalize { session_id: &s },
            Request::UploadCancel { session_id: &s },
            Request::Start,
            Request::Stop,
            Request::Destroy,
        ];
        assert!(base.iter().all(Request::in_base_abi));
        let storage = [
            Request::DownloadInit {
                cid: &s,
                chunk_size: 4,
                local: true,
            },
            Request::DownloadChunk { cid: &s },
            Request::DownloadManifest { cid: &s },
            Request::StorageList,
            Request::StorageExists { cid: &s },
        ];
        assert!(storage.iter().all(|r| !r.in_base_abi()));
        assert!(storage.iter().all(|r| r.name().starts_with("codex_download_")
            || r.name().starts_with("codex_storage_")));
    }

    #[test]
    fn null_node_ptr() {
        assert!(NodePtr::from_raw(std::ptr::null_mut()).is_null());
    }
}
