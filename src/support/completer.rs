//! Resettable, timeout-bound single-assignment rendezvous
//!
//! A `Completer` holds at most one value. Waiters suspend until the value is
//! set, the completer is reset, or their own deadline passes, whichever comes
//! first. Each `wait` call receives exactly one of those outcomes.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct Inner<T> {
    value: Option<T>,
    waiters: Vec<oneshot::Sender<Result<T>>>,
}

pub struct Completer<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Store the value and resolve every pending waiter with it
    pub fn set(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(value.clone()));
        }
    }

    /// Set when `Some`, otherwise drop a stored value
    ///
    /// Clearing an unset completer leaves its waiters suspended.
    pub fn set_opt(&self, value: Option<T>) {
        match value {
            Some(value) => self.set(value),
            None => self.clear(),
        }
    }

    pub fn clear(&self) {
        let had_value = self.inner.lock().value.is_some();
        if had_value {
            self.reset();
        }
    }

    pub fn value(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Wait for the value, failing with `timeout_error` after `timeout`
    ///
    /// Returns immediately when a value is already stored.
    pub async fn wait(&self, timeout: Duration, timeout_error: Error) -> Result<T> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(value) = &inner.value {
                return Ok(value.clone());
            }
            inner.waiters.retain(|w| !w.is_closed());
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Reset),
            Err(_) => Err(timeout_error),
        }
    }

    /// Fail pending waiters and return to the empty state
    pub fn reset(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.value = None;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Reset));
        }
    }

    pub(crate) fn waiter_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|w| !w.is_closed());
        inner.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> Error {
        Error::timeout("test")
    }

    #[tokio::test]
    async fn test_wait_after_set_returns_without_timer() {
        let completer = Completer::new();
        completer.set(7u32);
        // a zero deadline would fail if a timer were armed
        let value = completer.wait(Duration::ZERO, timeout_err()).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_waiters_resolved_by_one_set() {
        let completer: Completer<String> = Completer::new();
        let a = tokio::spawn({
            let c = completer.clone();
            async move { c.wait(Duration::from_secs(5), timeout_err()).await }
        });
        let b = tokio::spawn({
            let c = completer.clone();
            async move { c.wait(Duration::from_secs(5), timeout_err()).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(completer.waiter_count(), 2);

        completer.set("joined".to_string());
        assert_eq!(a.await.unwrap().unwrap(), "joined");
        assert_eq!(b.await.unwrap().unwrap(), "joined");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_with_given_error() {
        let completer: Completer<()> = Completer::new();
        let err = completer
            .wait(Duration::from_secs(7), Error::timeout("join"))
            .await
            .unwrap_err();
        assert_eq!(err, Error::timeout("join"));
        assert_eq!(completer.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_pending_and_clears_value() {
        let completer: Completer<u8> = Completer::new();
        let pending = tokio::spawn({
            let c = completer.clone();
            async move { c.wait(Duration::from_secs(10), timeout_err()).await }
        });
        tokio::task::yield_now().await;

        completer.reset();
        assert_eq!(pending.await.unwrap(), Err(Error::Reset));

        completer.set(1);
        completer.reset();
        assert!(!completer.is_set());

        // reusable after reset
        completer.set(2);
        assert_eq!(completer.value(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_on_unset_keeps_waiters() {
        let completer: Completer<()> = Completer::new();
        let pending = tokio::spawn({
            let c = completer.clone();
            async move { c.wait(Duration::from_secs(10), timeout_err()).await }
        });
        tokio::task::yield_now().await;

        completer.set_opt(None);
        assert_eq!(completer.waiter_count(), 1);

        completer.set_opt(Some(()));
        assert_eq!(pending.await.unwrap(), Ok(()));

        completer.set_opt(None);
        assert!(!completer.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_after_timeout_does_not_resurrect_waiter() {
        let completer: Completer<u8> = Completer::new();
        let first = completer.wait(Duration::from_millis(10), timeout_err()).await;
        assert!(first.unwrap_err().is_timeout());
        completer.set(3);
        assert_eq!(
            completer.wait(Duration::ZERO, timeout_err()).await.unwrap(),
            3
        );
    }
}
