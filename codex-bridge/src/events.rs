//! Event subscription channel: unsolicited native notifications routed to one handler
//! per node. Events never touch the call registry.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Arc, Mutex, OnceLock};

use crate::node::NodeId;
use crate::registry::lock;

/// One native event: status code and opaque message bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub code: c_int,
    pub message: Vec<u8>,
}

impl Event {
    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Node id → handler table used by [`on_native_event`].
#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<HashMap<NodeId, EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static EventRouter {
        static GLOBAL: OnceLock<EventRouter> = OnceLock::new();
        GLOBAL.get_or_init(EventRouter::new)
    }

    /// Install or replace the handler of `node`.
    pub fn register(&self, node: NodeId, handler: EventHandler) {
        lock(&self.handlers).insert(node, handler);
    }

    pub fn unregister(&self, node: NodeId) -> bool {
        lock(&self.handlers).remove(&node).is_some()
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        lock(&self.handlers).contains_key(&node)
    }

    /// Deliver `event` to the handler of `node`. Returns false if none is registered.
    pub fn dispatch(&self, node: NodeId, event: Event) -> bool {
        // Clone out so the handler runs unlocked and may re-register itself.
        let handler = lock(&self.handlers).get(&node).cloned();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                tracing::debug!(node = %node, code = event.code, "dropping event for unknown node");
                false
            }
        }
    }
}

/// `CodexCallback` registered through the native event subscription call.
///
/// # Safety
///
/// `msg` must be null or valid for `len` bytes for the duration of the call.
pub unsafe extern "C" fn on_native_event(
    ret: c_int,
    msg: *const c_char,
    len: usize,
    user_data: *mut c_void,
) {
    let message = if msg.is_null() || len == 0 {
        Vec::new()
    } else {
        // SAFETY: caller guarantees msg is valid for len bytes during this call.
        unsafe { slice::from_raw_parts(msg.cast::<u8>(), len) }.to_vec()
    };
    let node = NodeId::from_user_data(user_data);
    let event = Event { code: ret, message };
    if panic::catch_unwind(AssertUnwindSafe(|| EventRouter::global().dispatch(node, event))).is_err()
    {
        tracing::error!(node = %node, "event handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_reaches_registered_handler() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let node = NodeId::next();
        router.register(node, Arc::new(move |e: Event| s.lock().unwrap().push(e)));
        assert!(router.dispatch(
            node,
            Event {
                code: 0,
                message: b"peer joined".to_vec()
            }
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message_lossy(), "peer joined");
    }

    #[test]
    fn unknown_node_is_dropped() {
        let router = EventRouter::new();
        assert!(!router.dispatch(
            NodeId::next(),
            Event {
                code: 0,
                message: Vec::new()
            }
        ));
    }

    #[test]
    fn replace_and_unregister() {
        let router = EventRouter::new();
        let node = NodeId::next();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        router.register(node, Arc::new(move |_: Event| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = second.clone();
        router.register(node, Arc::new(move |_: Event| {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        let ev = Event {
            code: 0,
            message: Vec::new(),
        };
        router.dispatch(node, ev.clone());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(router.unregister(node));
        assert!(!router.dispatch(node, ev));
        assert!(!router.unregister(node));
    }

    #[test]
    fn message_lossy_replaces_invalid_utf8() {
        let e = Event {
            code: 1,
            message: vec![b'o', b'k', 0xff],
        };
        assert_eq!(e.message_lossy(), "ok\u{fffd}");
    }

    #[test]
    fn extern_entry_point_with_null_message() {
        let node = NodeId::next();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        EventRouter::global().register(
            node,
            Arc::new(move |e: Event| {
                assert!(e.message.is_empty());
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        unsafe { on_native_event(0, std::ptr::null(), 0, node.as_user_data()) };
        EventRouter::global().unregister(node);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
