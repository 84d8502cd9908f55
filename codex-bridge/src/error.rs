//! Error taxonomy of the bridge.

use std::ffi::c_int;

use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The native entry point refused to start the call.
    #[error("Failed the call to {call}. Returned code: {code}.")]
    Rejected { call: &'static str, code: c_int },
    /// The linked library does not export this entry point.
    #[error("{call} is not available in the linked libcodex")]
    Unsupported { call: &'static str },
    /// Terminal `RET_ERR` notification; the native message is passed through verbatim.
    #[error("{0}")]
    Native(String),
    /// The call context was dropped without a terminal notification.
    #[error("call to {call} was abandoned before completion")]
    Abandoned { call: &'static str },
    /// A session step failed and the cleanup cancel failed too.
    #[error("{error}; cancel also failed: {cancel_error}")]
    SessionAborted {
        error: Box<BridgeError>,
        cancel_error: Box<BridgeError>,
    },
    #[error("session {id} is {state:?}")]
    InvalidSessionState { id: String, state: SessionState },
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("cannot {op} a node that is {state}")]
    InvalidLifecycle { op: &'static str, state: &'static str },
    #[error("native component returned a null context")]
    NullContext,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::ffi::NulError> for BridgeError {
    fn from(e: std::ffi::NulError) -> Self {
        BridgeError::InvalidArgument(format!("interior NUL byte at {}", e.nul_position()))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
