//! Blocking and async bridge over the callback-driven libcodex C ABI.
//! Correlates native callbacks with waiting callers; the native component is reached
//! only through [`NativeApi`].

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod ffi;
pub mod native;
pub mod node;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use call::{call, call_async, call_streaming, call_with_progress, PendingCall};
pub use config::{LogFormat, LogLevel, NodeConfig, RepoKind};
pub use error::{BridgeError, Result};
pub use events::{Event, EventRouter};
pub use native::{NativeApi, NodePtr, Request};
pub use node::{Lifecycle, Node, NodeId};
pub use registry::{Registry, Token};
pub use session::{
    ContentId, DownloadOptions, DownloadSession, Manifest, SessionId, SessionState,
    TransferProgress, UploadOptions, UploadSession, DEFAULT_CHUNK_SIZE,
};

#[cfg(feature = "libcodex")]
pub use ffi::LibCodex;
