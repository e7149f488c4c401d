//! Multi-producer, single-consumer task queue of one reactor.
//!
//! The only way another thread hands work to a reactor. Pushing never
//! blocks. The wakeup protocol around `wakeup_needed`:
//!
//! - The reactor `arm()`s before blocking in its completion wait and
//!   `disarm()`s after.
//! - A producer pushes, then signals only if it is the one that flips the
//!   flag from `true` to `false`.
//!
//! Under load the flag is mostly `false` and producers never touch the
//! wakeup descriptor. A push racing with `arm()` is caught by the queue
//! re-check in `arm()` or by the producer's successful flip.

use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;
use tpc_core::error::Result;
use tpc_core::wakeup::WakeupSignal;
use tracing::warn;

use crate::config::SchedulingMode;

pub struct TaskQueue<T> {
    queue: SegQueue<T>,
    wakeup_needed: AtomicBool,
    signal: Box<dyn WakeupSignal>,
    spin: bool,
    owner: OnceLock<ThreadId>,
    wakeups: AtomicU64,
}

impl<T> TaskQueue<T> {
    pub fn new(signal: Box<dyn WakeupSignal>, mode: SchedulingMode) -> Self {
        Self {
            queue: SegQueue::new(),
            wakeup_needed: AtomicBool::new(false),
            signal,
            spin: mode == SchedulingMode::Spin,
            owner: OnceLock::new(),
            wakeups: AtomicU64::new(0),
        }
    }

    /// Record the calling thread as the consumer. Pushes from it never signal.
    pub fn bind_owner(&self) {
        let _ = self.owner.set(thread::current().id());
    }

    fn on_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    pub fn push(&self, task: T) {
        self.queue.push(task);
        if self.spin || self.on_owner_thread() {
            return;
        }
        fence(Ordering::SeqCst);
        if self
            .wakeup_needed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            self.wake();
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Announce an imminent blocking wait.
    ///
    /// Returns `false` when tasks are already queued; the caller must not
    /// block then.
    pub fn arm(&self) -> bool {
        self.wakeup_needed.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if self.queue.is_empty() {
            return true;
        }
        // Lost the flip to a producer: its signal is already on the way and
        // the wait returns immediately.
        self.wakeup_needed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
    }

    pub fn disarm(&self) {
        self.wakeup_needed.store(false, Ordering::SeqCst);
    }

    /// Signal unconditionally. Used to deliver a stop request.
    pub fn force_wakeup(&self) -> Result<()> {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.signal.signal()
    }

    fn wake(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.signal.signal() {
            warn!(error = %e, "wakeup signal failed");
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.signal.read_fd()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Signals written so far.
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSignal {
        count: Arc<AtomicU64>,
    }

    impl WakeupSignal for CountingSignal {
        fn signal(&self) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read_fd(&self) -> RawFd {
            -1
        }
    }

    fn queue(mode: SchedulingMode) -> (Arc<TaskQueue<u32>>, Arc<AtomicU64>) {
        let signal = CountingSignal::default();
        let count = signal.count.clone();
        (Arc::new(TaskQueue::new(Box::new(signal), mode)), count)
    }

    #[test]
    fn test_no_signal_while_disarmed() {
        let (q, count) = queue(SchedulingMode::Blocking);
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(q.len(), 10);
        assert_eq!(q.pop(), Some(0));
    }

    #[test]
    fn test_one_signal_per_armed_wait() {
        let (q, count) = queue(SchedulingMode::Blocking);
        assert!(q.arm());
        let producer = q.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                producer.push(i);
            }
        })
        .join()
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 100);
    }

    #[test]
    fn test_arm_refuses_with_queued_tasks() {
        let (q, count) = queue(SchedulingMode::Blocking);
        q.push(1);
        assert!(!q.arm());
        // Flag was taken back, so a later push does not signal either.
        let producer = q.clone();
        std::thread::spawn(move || producer.push(2)).join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_owner_thread_never_signals() {
        let (q, count) = queue(SchedulingMode::Blocking);
        q.bind_owner();
        assert!(q.arm());
        q.push(5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        q.disarm();
    }

    #[test]
    fn test_spin_mode_never_signals() {
        let (q, count) = queue(SchedulingMode::Spin);
        q.arm();
        let producer = q.clone();
        std::thread::spawn(move || producer.push(9)).join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        q.force_wakeup().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(q.wakeups(), 1);
    }
}
