//! One-shot completion slot shared between an invocation and its caller.
//!
//! The reactor side holds a [`Completer`]; the caller holds the
//! [`InvocationFuture`]. The caller can block (`wait`, `wait_timeout`), poll
//! (`try_result`), or `.await` it from any executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tpc_core::error::{Result, TpcError};

struct State<T> {
    value: Option<Result<T>>,
    waker: Option<Waker>,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(State {
                value: None,
                waker: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn set(&self, value: Result<T>) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value);
            state.waker.take()
        };
        self.ready.notify_all();
        if let Some(w) = waker {
            w.wake();
        }
        true
    }
}

/// Write half. Completing consumes it; dropping it unfinished fails the slot.
pub struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    /// Deliver the outcome. Returns `false` if the slot was already set.
    pub fn complete(self, value: Result<T>) -> bool {
        self.slot.set(value)
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.slot
            .set(Err(TpcError::Transport("invocation dropped".into())));
    }
}

/// Read half.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let slot = Arc::new(Slot::new());
    (
        Completer { slot: slot.clone() },
        Completion { slot },
    )
}

impl<T: Clone> Completion<T> {
    pub fn is_done(&self) -> bool {
        self.slot.state.lock().value.is_some()
    }

    pub fn try_result(&self) -> Option<Result<T>> {
        self.slot.state.lock().value.clone()
    }

    pub fn wait(&self) -> Result<T> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(v) = &state.value {
                return v.clone();
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// `None` if nothing arrived within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(v) = &state.value {
                return Some(v.clone());
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return state.value.clone();
            }
        }
    }

    fn poll_value(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut state = self.slot.state.lock();
        match &state.value {
            Some(v) => Poll::Ready(v.clone()),
            None => {
                match &state.waker {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    _ => state.waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

/// Caller-facing handle returned by `Engine::invoke`.
///
/// The transport enforces no timeout; callers that need one use
/// [`InvocationFuture::wait_timeout`] or race the future in their executor.
pub struct InvocationFuture {
    correlation_id: u64,
    inner: Completion<Bytes>,
}

impl InvocationFuture {
    pub(crate) fn new(correlation_id: u64, inner: Completion<Bytes>) -> Self {
        Self {
            correlation_id,
            inner,
        }
    }

    /// A future that is already complete.
    pub(crate) fn ready(correlation_id: u64, value: Result<Bytes>) -> Self {
        let (completer, inner) = completion();
        completer.complete(value);
        Self::new(correlation_id, inner)
    }

    pub(crate) fn failed(err: TpcError) -> Self {
        Self::ready(0, Err(err))
    }

    /// 0 for invocations that never reached the invocation table.
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn try_result(&self) -> Option<Result<Bytes>> {
        self.inner.try_result()
    }

    pub fn wait(self) -> Result<Bytes> {
        self.inner.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Bytes>> {
        self.inner.wait_timeout(timeout)
    }
}

impl Future for InvocationFuture {
    type Output = Result<Bytes>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_value(cx)
    }
}

impl std::fmt::Debug for InvocationFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationFuture")
            .field("correlation_id", &self.correlation_id)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;
    use std::thread;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_complete_once() {
        let (tx, rx) = completion::<u32>();
        assert!(!rx.is_done());
        assert!(tx.complete(Ok(7)));
        assert_eq!(rx.try_result(), Some(Ok(7)));
        assert_eq!(rx.wait(), Ok(7));
    }

    #[test]
    fn test_dropped_completer_fails() {
        let (tx, rx) = completion::<u32>();
        drop(tx);
        assert_eq!(
            rx.wait(),
            Err(TpcError::Transport("invocation dropped".into()))
        );
    }

    #[test]
    fn test_wait_across_threads() {
        let (tx, rx) = completion::<Bytes>();
        let fut = InvocationFuture::new(42, rx);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.complete(Ok(Bytes::from_static(b"done")));
        });
        assert_eq!(fut.correlation_id(), 42);
        assert_eq!(fut.wait().unwrap(), Bytes::from_static(b"done"));
        h.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (_tx, rx) = completion::<Bytes>();
        let fut = InvocationFuture::new(1, rx);
        let start = Instant::now();
        assert!(fut.wait_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_poll_registers_waker() {
        let (tx, rx) = completion::<Bytes>();
        let mut fut = InvocationFuture::new(3, rx);
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        tx.complete(Ok(Bytes::new()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(Bytes::new())));
    }

    #[test]
    fn test_failed_future() {
        let fut = InvocationFuture::failed(TpcError::ShuttingDown);
        assert!(fut.is_done());
        assert_eq!(fut.correlation_id(), 0);
        assert_eq!(fut.wait(), Err(TpcError::ShuttingDown));
    }
}
