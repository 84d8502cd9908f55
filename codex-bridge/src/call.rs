//! Call façade: one native request turned into one blocking or awaitable result.
//!
//! The blocking forms (`call`, `call_with_progress`, `call_streaming`, `PendingCall::wait`)
//! must not be used from inside an async runtime worker; use `call_async` there.

use std::ffi::{c_int, c_void};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::thread;

use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};
use crate::ffi::{CodexCallback, RET_OK, RET_UNSUPPORTED};
use crate::registry::{lock, Outcome, ProgressSink, Registry, Token};
use crate::router::on_native_callback;

/// Issue a call and block until its terminal notification.
///
/// `invoke` receives the router callback and the `user_data` token and returns the
/// native entry point's immediate status.
pub fn call<F>(name: &'static str, invoke: F) -> Result<Vec<u8>>
where
    F: FnOnce(CodexCallback, *mut c_void) -> c_int,
{
    begin(name, None, invoke)?.wait()
}

/// Like [`call`], forwarding progress notifications to `progress`.
pub fn call_with_progress<F>(name: &'static str, progress: ProgressSink, invoke: F) -> Result<Vec<u8>>
where
    F: FnOnce(CodexCallback, *mut c_void) -> c_int,
{
    begin(name, Some(progress), invoke)?.wait()
}

/// Issue a call on this thread and return a handle to its pending outcome.
pub fn call_async<F>(name: &'static str, invoke: F) -> Result<PendingCall>
where
    F: FnOnce(CodexCallback, *mut c_void) -> c_int,
{
    begin(name, None, invoke)
}

/// Issue a call whose progress chunks are consumed by `on_chunk` on the calling thread.
///
/// Returns after the terminal notification and every chunk delivered before it have been
/// handled. If `on_chunk` fails, remaining chunks are drained and discarded and its error
/// wins over the call's own outcome.
pub fn call_streaming<F, S>(name: &'static str, invoke: F, mut on_chunk: S) -> Result<Vec<u8>>
where
    F: FnOnce(CodexCallback, *mut c_void) -> c_int,
    S: FnMut(&[u8]) -> Result<()>,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let tx = Mutex::new(tx);
    let sink: ProgressSink = Box::new(move |_len: usize, chunk: Option<&[u8]>| {
        if let Some(bytes) = chunk {
            let _ = lock(&tx).send(bytes.to_vec());
        }
    });
    let pending = begin(name, Some(sink), invoke)?;

    // The sender lives in the call context, which is dropped right after the terminal
    // notification, so this loop ends exactly when the call does.
    let mut sink_error = None;
    for chunk in rx {
        if sink_error.is_some() {
            continue;
        }
        if let Err(e) = on_chunk(&chunk) {
            tracing::debug!(call = name, error = %e, "stream sink failed; draining");
            sink_error = Some(e);
        }
    }
    let outcome = pending.wait();
    match sink_error {
        Some(e) => Err(e),
        None => outcome,
    }
}

fn begin<F>(name: &'static str, progress: Option<ProgressSink>, invoke: F) -> Result<PendingCall>
where
    F: FnOnce(CodexCallback, *mut c_void) -> c_int,
{
    let registry = Registry::global();
    let (token, rx) = registry.allocate(progress);
    tracing::trace!(call = name, %token, "issuing native call");
    let code = invoke(on_native_callback, token.as_user_data());
    if code != RET_OK {
        registry.delete(token);
        tracing::debug!(call = name, %token, code, "native call rejected");
        if code == RET_UNSUPPORTED {
            return Err(BridgeError::Unsupported { call: name });
        }
        return Err(BridgeError::Rejected { call: name, code });
    }
    Ok(PendingCall {
        call: name,
        token,
        rx,
    })
}

/// A call accepted by the native component whose terminal notification is pending.
///
/// Await it, [`wait`](PendingCall::wait) on it, or hand it a completion callback.
#[derive(Debug)]
pub struct PendingCall {
    call: &'static str,
    token: Token,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn name(&self) -> &'static str {
        self.call
    }

    /// Block until the terminal notification.
    pub fn wait(self) -> Result<Vec<u8>> {
        let call = self.call;
        self.rx
            .blocking_recv()
            .unwrap_or(Err(BridgeError::Abandoned { call }))
    }

    /// Wait on a background thread and invoke `on_done` with the outcome.
    pub fn on_complete<F>(self, on_done: F) -> io::Result<thread::JoinHandle<()>>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("{}-{}", self.call, self.token))
            .spawn(move || on_done(self.wait()))
    }
}

impl Future for PendingCall {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let call = this.call;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(BridgeError::Abandoned { call })))
    }
}
