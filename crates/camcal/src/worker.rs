//! Background workers with cooperative cancellation and bounded joins.

use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

/// Shared cancellation flag, checked by workers once per frame.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when
    /// cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }
}

/// A named thread plus the token that stops it.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    cancel: CancelToken,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: &str, cancel: CancelToken, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
        })
    }
}

impl<T> Worker<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    /// `true` once the thread has returned or been detached.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the thread to return on its own. `None` on timeout, when
    /// already joined, or when the thread panicked.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<T> {
        let start = Instant::now();
        loop {
            let handle = self.handle.as_ref()?;
            if handle.is_finished() {
                return self.join_now();
            }
            if timeout.is_some_and(|t| start.elapsed() >= t) {
                return None;
            }
            thread::sleep(POLL);
        }
    }

    /// Request cancellation and wait up to `timeout`. A thread that misses
    /// the deadline is detached; it still cleans up once it sees the flag.
    pub fn cancel_and_join(&mut self, timeout: Duration) -> Option<T> {
        self.cancel.cancel();
        let joined = self.wait(Some(timeout));
        if joined.is_none() && self.handle.take().is_some() {
            warn!("worker `{}` did not stop within {timeout:?}; detached", self.name);
        }
        joined
    }

    fn join_now(&mut self) -> Option<T> {
        match self.handle.take()?.join() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("worker `{}` panicked", self.name);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let t0 = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert!(CancelToken::new().sleep(Duration::from_millis(1)));
    }

    #[test]
    fn cooperative_worker_joins_after_cancel() {
        let token = CancelToken::new();
        let inner = token.clone();
        let mut worker = Worker::spawn("spin", token, move || {
            let mut n = 0u64;
            while !inner.is_cancelled() {
                n += 1;
                thread::sleep(Duration::from_millis(1));
            }
            n
        })
        .expect("spawn");
        assert!(!worker.is_finished());
        assert!(worker.cancel_and_join(Duration::from_secs(2)).is_some());
        assert!(worker.is_finished());
        assert!(worker.wait(None).is_none());
    }

    #[test]
    fn stuck_worker_is_detached_after_deadline() {
        let token = CancelToken::new();
        let mut worker = Worker::spawn("stuck", token, || {
            thread::sleep(Duration::from_millis(300));
            1
        })
        .expect("spawn");
        assert_eq!(worker.cancel_and_join(Duration::from_millis(20)), None);
        assert!(worker.is_finished());
    }

    #[test]
    fn wait_returns_value() {
        let mut worker = Worker::spawn("quick", CancelToken::new(), || 7).expect("spawn");
        assert_eq!(worker.wait(None), Some(7));
    }
}
