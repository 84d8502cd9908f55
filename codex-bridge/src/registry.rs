//! Correlation registry: single-use tokens bound to pending call contexts.
//!
//! The token travels through the native `user_data` pointer as a plain integer, so a
//! late or duplicate callback can only ever miss the table, never reach freed memory.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::oneshot;

use crate::error::BridgeError;

/// Outcome delivered to the waiter: result payload or error, never both.
pub type Outcome = Result<Vec<u8>, BridgeError>;

/// Progress sink: `(byte count, optional chunk)`.
pub type ProgressSink = Box<dyn Fn(usize, Option<&[u8]>) + Send + Sync>;

/// Process-unique correlation token. Values start at 1 and are never reissued.
/// Pointer-width, so every token survives the trip through `user_data` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(usize);

impl Token {
    /// Token value as the native `user_data` argument.
    pub fn as_user_data(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    /// Recover a token from `user_data`. Any value is accepted; unknown ones miss on lookup.
    pub fn from_user_data(user_data: *mut c_void) -> Self {
        Token(user_data as usize)
    }

    pub fn from_raw(raw: usize) -> Self {
        Token(raw)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pending call: completion signal plus optional progress sink.
pub struct CallContext {
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
    progress: Option<ProgressSink>,
}

impl CallContext {
    /// Forward a progress notification. No-op without a sink.
    pub fn progress(&self, len: usize, chunk: Option<&[u8]>) {
        if let Some(sink) = &self.progress {
            sink(len, chunk);
        }
    }

    /// Fire the completion signal. Returns false if it already fired.
    pub fn complete(&self, outcome: Outcome) -> bool {
        match lock(&self.completion).take() {
            Some(tx) => {
                // The waiter may have given up (PendingCall dropped); that is not an error.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn has_progress_sink(&self) -> bool {
        self.progress.is_some()
    }
}

/// Token → context table. Safe for concurrent allocate/lookup/delete.
pub struct Registry {
    next: AtomicUsize,
    pending: Mutex<HashMap<Token, Arc<CallContext>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registry used by the native callback router.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Bind a fresh context to a new token. Returns the token and the waiter side.
    pub fn allocate(&self, progress: Option<ProgressSink>) -> (Token, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let token = Token(self.next.fetch_add(1, Ordering::Relaxed));
        let ctx = Arc::new(CallContext {
            completion: Mutex::new(Some(tx)),
            progress,
        });
        lock(&self.pending).insert(token, ctx);
        (token, rx)
    }

    /// Context bound to `token`, if still pending.
    pub fn lookup(&self, token: Token) -> Option<Arc<CallContext>> {
        lock(&self.pending).get(&token).cloned()
    }

    /// Unbind `token`. Only the first caller gets the context back.
    pub fn delete(&self, token: Token) -> Option<Arc<CallContext>> {
        lock(&self.pending).remove(&token)
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, token: Token) -> bool {
        lock(&self.pending).contains_key(&token)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock ignoring poisoning: every critical section here leaves the data consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn allocate_then_lookup() {
        let reg = Registry::new();
        let (token, _rx) = reg.allocate(None);
        assert!(reg.lookup(token).is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn delete_then_lookup_misses() {
        let reg = Registry::new();
        let (token, _rx) = reg.allocate(None);
        assert!(reg.delete(token).is_some());
        assert!(reg.lookup(token).is_none());
        assert!(reg.delete(token).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_of_never_issued_token() {
        let reg = Registry::new();
        assert!(reg.lookup(Token::from_raw(0)).is_none());
        assert!(reg.lookup(Token::from_raw(987_654)).is_none());
    }

    #[test]
    fn tokens_are_not_reused_after_delete() {
        let reg = Registry::new();
        let (a, _ra) = reg.allocate(None);
        reg.delete(a);
        let (b, _rb) = reg.allocate(None);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let reg = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || {
                    (0..200)
                        .map(|_| {
                            let (t, _rx) = reg.allocate(None);
                            t
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t), "token {t} issued twice");
            }
        }
        assert_eq!(seen.len(), 1600);
        assert_eq!(reg.len(), 1600);
    }

    #[test]
    fn completion_fires_once() {
        let reg = Registry::new();
        let (token, rx) = reg.allocate(None);
        let ctx = reg.delete(token).unwrap();
        assert!(ctx.complete(Ok(b"first".to_vec())));
        assert!(!ctx.complete(Ok(b"second".to_vec())));
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), b"first");
    }

    #[test]
    fn user_data_roundtrip() {
        let reg = Registry::new();
        let (token, _rx) = reg.allocate(None);
        assert_eq!(Token::from_user_data(token.as_user_data()), token);
    }

    #[test]
    fn widest_token_survives_user_data() {
        for raw in [usize::MAX, usize::MAX >> 1, 1 << (usize::BITS - 1)] {
            let token = Token::from_raw(raw);
            assert_eq!(Token::from_user_data(token.as_user_data()).get(), raw);
        }
    }
}
