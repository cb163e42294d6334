//! Synchronization fences guarding buffer contents.
//!
//! A [`Fence`] is the "safe to touch this buffer now" signal that travels with
//! a buffer through the queue. The queue itself never waits on fences; it only
//! stores and hands them across so the producer and consumer can order their
//! accesses to buffer contents independently of the queue lock.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    Signaled,
    Error,
}

/// Shared, clonable fence handle. All clones observe the same state.
#[derive(Clone, Debug)]
pub struct Fence {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    /// A fence that has not fired yet.
    pub fn new() -> Self {
        Fence::with_state(FenceState::Unsignaled)
    }

    /// An already-signaled fence, used wherever no synchronization is needed.
    pub fn signaled() -> Self {
        Fence::with_state(FenceState::Signaled)
    }

    fn with_state(state: FenceState) -> Self {
        Fence {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> FenceState {
        *self.inner.state.lock().unwrap()
    }

    /// Fire the fence. Signaling twice, or after an error, is a no-op.
    pub fn signal(&self) {
        self.transition(FenceState::Signaled)
    }

    /// Fire the fence in the error state, releasing waiters with a failure.
    pub fn signal_error(&self) {
        self.transition(FenceState::Error)
    }

    fn transition(&self, to: FenceState) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == FenceState::Unsignaled {
            *state = to;
            self.inner.cond.notify_all();
        }
    }

    /// Block until the fence fires or `timeout` elapses.
    ///
    /// Returns the state observed when the wait ended; [`FenceState::Unsignaled`]
    /// means the wait timed out.
    pub fn wait(&self, timeout: Duration) -> FenceState {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| *s == FenceState::Unsignaled)
            .unwrap();
        *state
    }
}

impl Default for Fence {
    fn default() -> Self {
        Fence::signaled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signaled_constructor() {
        let fence = Fence::signaled();
        assert_eq!(fence.state(), FenceState::Signaled);
        assert_eq!(fence.wait(Duration::from_millis(1)), FenceState::Signaled);
    }

    #[test]
    fn test_wait_times_out() {
        let fence = Fence::new();
        assert_eq!(
            fence.wait(Duration::from_millis(10)),
            FenceState::Unsignaled
        );
    }

    #[test]
    fn test_clones_share_state() {
        let fence = Fence::new();
        let clone = fence.clone();
        fence.signal();
        assert_eq!(clone.state(), FenceState::Signaled);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let fence = Fence::new();
        let waiter = fence.clone();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        fence.signal();
        assert_eq!(handle.join().unwrap(), FenceState::Signaled);
    }

    #[test]
    fn test_error_is_terminal() {
        let fence = Fence::new();
        fence.signal_error();
        fence.signal();
        assert_eq!(fence.state(), FenceState::Error);
    }
}
