//! Callback router: the single function libcodex calls back for every request.

use std::ffi::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::slice;

use crate::error::BridgeError;
use crate::ffi::{RET_ERR, RET_OK, RET_PROGRESS};
use crate::registry::{Registry, Token};

/// Classification of a callback status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Success,
    Failure,
    Progress,
    /// Any other code. Treated as a terminal failure so the waiter is released.
    Unknown(c_int),
}

impl CallbackStatus {
    pub fn from_code(code: c_int) -> Self {
        match code {
            RET_OK => CallbackStatus::Success,
            RET_ERR => CallbackStatus::Failure,
            RET_PROGRESS => CallbackStatus::Progress,
            other => CallbackStatus::Unknown(other),
        }
    }
}

/// What the router did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Token unbound: late, duplicate or never issued.
    Dropped,
    Progress,
    Completed,
}

/// `CodexCallback` handed to every native entry point.
///
/// # Safety
///
/// `msg` must be null or valid for `len` bytes for the duration of the call.
pub unsafe extern "C" fn on_native_callback(
    ret: c_int,
    msg: *const c_char,
    len: usize,
    user_data: *mut c_void,
) {
    let payload = if msg.is_null() || len == 0 {
        None
    } else {
        // SAFETY: caller guarantees msg is valid for len bytes during this call.
        Some(unsafe { slice::from_raw_parts(msg.cast::<u8>(), len) })
    };
    let token = Token::from_user_data(user_data);
    let status = CallbackStatus::from_code(ret);
    // A panic in a progress sink must not unwind into the native caller.
    let routed = panic::catch_unwind(AssertUnwindSafe(|| {
        route(Registry::global(), status, len, payload, token)
    }));
    if routed.is_err() {
        tracing::error!(%token, ?status, "panic while routing native callback");
    }
}

/// Route one notification for `token` against `registry`.
pub fn route(
    registry: &Registry,
    status: CallbackStatus,
    len: usize,
    payload: Option<&[u8]>,
    token: Token,
) -> Routed {
    match status {
        CallbackStatus::Progress => {
            let Some(ctx) = registry.lookup(token) else {
                tracing::trace!(%token, len, "dropping progress for unbound token");
                return Routed::Dropped;
            };
            ctx.progress(len, payload);
            Routed::Progress
        }
        CallbackStatus::Success | CallbackStatus::Failure | CallbackStatus::Unknown(_) => {
            // Unbind before signalling so a resumed waiter never sees a live token.
            let Some(ctx) = registry.delete(token) else {
                tracing::debug!(%token, ?status, "dropping terminal notification for unbound token");
                return Routed::Dropped;
            };
            let bytes = payload.unwrap_or_default();
            let outcome = match status {
                CallbackStatus::Success => Ok(bytes.to_vec()),
                CallbackStatus::Failure => {
                    Err(BridgeError::Native(String::from_utf8_lossy(bytes).into_owned()))
                }
                CallbackStatus::Unknown(code) => {
                    tracing::warn!(%token, code, "unexpected callback status");
                    Err(BridgeError::Native(format!(
                        "unexpected callback status {code}: {}",
                        String::from_utf8_lossy(bytes)
                    )))
                }
                CallbackStatus::Progress => unreachable!("handled above"),
            };
            ctx.complete(outcome);
            Routed::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn classify_codes() {
        assert_eq!(CallbackStatus::from_code(0), CallbackStatus::Success);
        assert_eq!(CallbackStatus::from_code(1), CallbackStatus::Failure);
        assert_eq!(CallbackStatus::from_code(3), CallbackStatus::Progress);
        assert_eq!(CallbackStatus::from_code(7), CallbackStatus::Unknown(7));
    }

    #[test]
    fn success_completes_and_unbinds() {
        let reg = Registry::new();
        let (token, rx) = reg.allocate(None);
        let r = route(&reg, CallbackStatus::Success, 5, Some(b"hello"), token);
        assert_eq!(r, Routed::Completed);
        assert!(reg.lookup(token).is_none());
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn failure_carries_native_message() {
        let reg = Registry::new();
        let (token, rx) = reg.allocate(None);
        route(&reg, CallbackStatus::Failure, 8, Some(b"no space"), token);
        match rx.blocking_recv().unwrap() {
            Err(BridgeError::Native(msg)) => assert_eq!(msg, "no space"),
            other => panic!("expected native error, got {other:?}"),
        }
    }

    #[test]
    fn second_terminal_is_dropped() {
        let reg = Registry::new();
        let (token, rx) = reg.allocate(None);
        assert_eq!(
            route(&reg, CallbackStatus::Success, 2, Some(b"ok"), token),
            Routed::Completed
        );
        assert_eq!(
            route(&reg, CallbackStatus::Failure, 4, Some(b"late"), token),
            Routed::Dropped
        );
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), b"ok");
    }

    #[test]
    fn progress_reaches_sink_before_terminal_only() {
        let reg = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let (token, _rx) = reg.allocate(Some(Box::new(move |len: usize, chunk: Option<&[u8]>| {
            sink_seen
                .lock()
                .unwrap()
                .push((len, chunk.map(<[u8]>::to_vec)));
        })));

        assert_eq!(
            route(&reg, CallbackStatus::Progress, 3, Some(b"abc"), token),
            Routed::Progress
        );
        assert_eq!(
            route(&reg, CallbackStatus::Progress, 10, None, token),
            Routed::Progress
        );
        route(&reg, CallbackStatus::Success, 0, None, token);
        assert_eq!(
            route(&reg, CallbackStatus::Progress, 3, Some(b"xyz"), token),
            Routed::Dropped
        );

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(3, Some(b"abc".to_vec())), (10, None)]);
    }

    #[test]
    fn progress_without_sink_is_noop() {
        let reg = Registry::new();
        let (token, _rx) = reg.allocate(None);
        assert_eq!(
            route(&reg, CallbackStatus::Progress, 1, Some(b"x"), token),
            Routed::Progress
        );
        assert!(reg.contains(token));
    }

    #[test]
    fn unknown_token_is_dropped() {
        let reg = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let (_live, _rx) = reg.allocate(Some(Box::new(move |_: usize, _: Option<&[u8]>| {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        let stranger = Token::from_raw(usize::MAX);
        assert_eq!(
            route(&reg, CallbackStatus::Progress, 1, Some(b"x"), stranger),
            Routed::Dropped
        );
        assert_eq!(
            route(&reg, CallbackStatus::Success, 0, None, stranger),
            Routed::Dropped
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unknown_status_is_terminal_failure() {
        let reg = Registry::new();
        let (token, rx) = reg.allocate(None);
        route(&reg, CallbackStatus::Unknown(42), 3, Some(b"odd"), token);
        match rx.blocking_recv().unwrap() {
            Err(BridgeError::Native(msg)) => assert!(msg.contains("42")),
            other => panic!("expected native error, got {other:?}"),
        }
    }

    #[test]
    fn extern_entry_point_drops_unknown_user_data() {
        // Token 0 is never issued.
        unsafe { on_native_callback(RET_OK, std::ptr::null(), 0, std::ptr::null_mut()) };
    }
}
