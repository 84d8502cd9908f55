//! C ABI of libcodex: callback type, return codes and, with the `libcodex` feature,
//! the linked entry points.
//!
//! The base entry points follow `libcodex.h`. The download and storage calls are only
//! linked with `libcodex-storage`, for libraries built with the storage API; without it
//! those requests fail with [`RET_UNSUPPORTED`].
//!
//! Every entry point takes a `CodexCallback` plus an opaque `user_data` pointer and
//! returns an immediate status. The library later invokes the callback zero or more
//! times with `RET_PROGRESS` and exactly once with `RET_OK` or `RET_ERR`, always
//! passing `user_data` back unchanged.

use std::ffi::{c_char, c_int, c_void};

/// Terminal success; the message is the result payload.
pub const RET_OK: c_int = 0;
/// Terminal failure; the message is a UTF-8 error string.
pub const RET_ERR: c_int = 1;
/// Immediate status: the call was issued without a callback.
pub const RET_MISSING_CALLBACK: c_int = 2;
/// Non-terminal progress; the message is an optional chunk of bytes.
pub const RET_PROGRESS: c_int = 3;
/// Bridge-side immediate status: the linked library does not export the entry point.
pub const RET_UNSUPPORTED: c_int = -1;

/// Callback invoked by libcodex for every notification of a call or event.
pub type CodexCallback =
    unsafe extern "C" fn(ret: c_int, msg: *const c_char, len: usize, user_data: *mut c_void);

#[cfg(feature = "libcodex")]
pub use linked::LibCodex;

#[cfg(feature = "libcodex")]
mod linked {
    use std::ffi::{c_char, c_int, c_void, CStr};

    use super::{CodexCallback, RET_UNSUPPORTED};
    use crate::native::{NativeApi, NodePtr, Request};

    #[link(name = "codex")]
    extern "C" {
        fn codex_new(config_json: *const c_char, callback: CodexCallback, user_data: *mut c_void)
            -> *mut c_void;
        fn codex_version(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_revision(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void)
            -> c_int;
        fn codex_repo(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_debug(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_spr(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_peer_id(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_log_level(
            ctx: *mut c_void,
            log_level: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_connect(
            ctx: *mut c_void,
            peer_id: *const c_char,
            peer_addresses: *const *const c_char,
            peer_addresses_size: usize,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_peer_debug(
            ctx: *mut c_void,
            peer_id: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_upload_init(
            ctx: *mut c_void,
            mimetype: *const c_char,
            filename: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_upload_chunk(
            ctx: *mut c_void,
            session_id: *const c_char,
            chunk: *const u8,
            len: usize,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_upload_finalize(
            ctx: *mut c_void,
            session_id: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_upload_cancel(
            ctx: *mut c_void,
            session_id: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_start(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_stop(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void) -> c_int;
        fn codex_destroy(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void)
            -> c_int;
        fn codex_set_event_callback(
            ctx: *mut c_void,
            callback: CodexCallback,
            user_data: *mut c_void,
        );
    }

    #[cfg(feature = "libcodex-storage")]
    #[link(name = "codex")]
    extern "C" {
        fn codex_download_init(
            ctx: *mut c_void,
            cid: *const c_char,
            chunk_size: usize,
            local: bool,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_download_chunk(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_download_stream(
            ctx: *mut c_void,
            cid: *const c_char,
            chunk_size: usize,
            local: bool,
            filepath: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_download_cancel(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_download_manifest(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_storage_list(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void)
            -> c_int;
        fn codex_storage_space(ctx: *mut c_void, callback: CodexCallback, user_data: *mut c_void)
            -> c_int;
        fn codex_storage_delete(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_storage_fetch(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
        fn codex_storage_exists(
            ctx: *mut c_void,
            cid: *const c_char,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int;
    }

    fn opt_ptr(s: Option<&CStr>) -> *const c_char {
        s.map_or(std::ptr::null(), CStr::as_ptr)
    }

    /// libcodex linked as a native library.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LibCodex;

    impl NativeApi for LibCodex {
        fn create(
            &self,
            config_json: &CStr,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> *mut c_void {
            // SAFETY: config_json is NUL-terminated and outlives the call; libcodex copies it.
            unsafe { codex_new(config_json.as_ptr(), callback, user_data) }
        }

        fn invoke(
            &self,
            node: NodePtr,
            request: &Request<'_>,
            callback: CodexCallback,
            user_data: *mut c_void,
        ) -> c_int {
            let ctx = node.as_ptr();
            // SAFETY: ctx was returned by codex_new and is not yet destroyed (Node guarantees
            // this); every pointer argument borrows from `request`, and libcodex copies its
            // arguments before returning.
            unsafe {
                match request {
                    Request::Version => codex_version(ctx, callback, user_data),
                    Request::Revision => codex_revision(ctx, callback, user_data),
                    Request::Repo => codex_repo(ctx, callback, user_data),
                    Request::Debug => codex_debug(ctx, callback, user_data),
                    Request::Spr => codex_spr(ctx, callback, user_data),
                    Request::PeerId => codex_peer_id(ctx, callback, user_data),
                    Request::LogLevel { level } => {
                        codex_log_level(ctx, level.as_ptr(), callback, user_data)
                    }
                    Request::Connect { peer_id, addrs } => {
                        let ptrs: Vec<*const c_char> = addrs.iter().map(|a| a.as_ptr()).collect();
                        codex_connect(
                            ctx,
                            peer_id.as_ptr(),
                            ptrs.as_ptr(),
                            ptrs.len(),
                            callback,
                            user_data,
                        )
                    }
                    Request::PeerDebug { peer_id } => {
                        codex_peer_debug(ctx, peer_id.as_ptr(), callback, user_data)
                    }
                    Request::UploadInit { mimetype, filename } => codex_upload_init(
                        ctx,
                        opt_ptr(*mimetype),
                        opt_ptr(*filename),
                        callback,
                        user_data,
                    ),
                    Request::UploadChunk { session_id, chunk } => codex_upload_chunk(
                        ctx,
                        session_id.as_ptr(),
                        chunk.as_ptr(),
                        chunk.len(),
                        callback,
                        user_data,
                    ),
                    Request::UploadFinalize { session_id } => {
                        codex_upload_finalize(ctx, session_id.as_ptr(), callback, user_data)
                    }
                    Request::UploadCancel { session_id } => {
                        codex_upload_cancel(ctx, session_id.as_ptr(), callback, user_data)
                    }
                    Request::Start => codex_start(ctx, callback, user_data),
                    Request::Stop => codex_stop(ctx, callback, user_data),
                    Request::Destroy => codex_destroy(ctx, callback, user_data),
                    _ => invoke_storage(ctx, request, callback, user_data),
                }
            }
        }

        fn set_event_callback(&self, node: NodePtr, callback: CodexCallback, user_data: *mut c_void) {
            // SAFETY: ctx was returned by codex_new and is not yet destroyed.
            unsafe { codex_set_event_callback(node.as_ptr(), callback, user_data) }
        }
    }

    /// Download and storage entry points.
    ///
    /// # Safety
    ///
    /// Same contract as [`NativeApi::invoke`]: `ctx` is live and `request` outlives the call.
    #[cfg(feature = "libcodex-storage")]
    unsafe fn invoke_storage(
        ctx: *mut c_void,
        request: &Request<'_>,
        callback: CodexCallback,
        user_data: *mut c_void,
    ) -> c_int {
        // SAFETY: forwarded from the caller's contract.
        unsafe {
            match request {
                Request::DownloadInit {
                    cid,
                    chunk_size,
                    local,
                } => codex_download_init(
                    ctx,
                    cid.as_ptr(),
                    *chunk_size,
                    *local,
                    callback,
                    user_data,
                ),
                Request::DownloadChunk { cid } => {
                    codex_download_chunk(ctx, cid.as_ptr(), callback, user_data)
                }
                Request::DownloadStream {
                    cid,
                    chunk_size,
                    local,
                    filepath,
                } => codex_download_stream(
                    ctx,
                    cid.as_ptr(),
                    *chunk_size,
                    *local,
                    opt_ptr(*filepath),
                    callback,
                    user_data,
                ),
                Request::DownloadCancel { cid } => {
                    codex_download_cancel(ctx, cid.as_ptr(), callback, user_data)
                }
                Request::DownloadManifest { cid } => {
                    codex_download_manifest(ctx, cid.as_ptr(), callback, user_data)
                }
                Request::StorageList => codex_storage_list(ctx, callback, user_data),
                Request::StorageSpace => codex_storage_space(ctx, callback, user_data),
                Request::StorageDelete { cid } => {
                    codex_storage_delete(ctx, cid.as_ptr(), callback, user_data)
                }
                Request::StorageFetch { cid } => {
                    codex_storage_fetch(ctx, cid.as_ptr(), callback, user_data)
                }
                Request::StorageExists { cid } => {
                    codex_storage_exists(ctx, cid.as_ptr(), callback, user_data)
                }
                _ => RET_UNSUPPORTED,
            }
        }
    }

    #[cfg(not(feature = "libcodex-storage"))]
    unsafe fn invoke_storage(
        _ctx: *mut c_void,
        request: &Request<'_>,
        _callback: CodexCallback,
        _user_data: *mut c_void,
    ) -> c_int {
        tracing::warn!(call = request.name(), "entry point not linked; enable libcodex-storage");
        RET_UNSUPPORTED
    }
}
