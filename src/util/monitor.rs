//! A value that tasks can wait on.
//!
//! Used for barrier leave counts and for the version gate that bounds how
//! far a master may run ahead of its slowest slave.

use std::time::Duration;

use tokio::sync::watch;

/// A watched value with blocking comparisons.
#[derive(Debug)]
pub struct Monitor<T> {
    tx: watch::Sender<T>,
}

impl<T> Monitor<T>
where
    T: Copy + PartialOrd + Send + Sync,
{
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx }
    }

    pub fn get(&self) -> T {
        *self.tx.borrow()
    }

    /// Store a value and wake all waiters.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Apply `f` to the value and wake all waiters. Returns the new value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let mut out = self.get();
        self.tx.send_modify(|v| {
            *v = f(*v);
            out = *v;
        });
        out
    }

    /// Raise the value to `value` if it is larger.
    pub fn raise(&self, value: T) {
        self.tx.send_if_modified(|v| {
            if value > *v {
                *v = value;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the value is at least `value`.
    pub async fn wait_ge(&self, value: T) -> T {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|v| *v >= value).await {
            Ok(v) => *v,
            // Sender lives in self, so the channel cannot close while we wait.
            Err(_) => self.get(),
        }
    }

    /// Wait until the value is at least `value`, or give up after `timeout`.
    ///
    /// Returns `None` on timeout.
    pub async fn timed_wait_ge(&self, value: T, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.wait_ge(value)).await.ok()
    }
}

impl<T: std::ops::Add<Output = T> + From<u8> + Copy + PartialOrd + Send + Sync> Monitor<T> {
    /// Increment by one and wake all waiters.
    pub fn increment(&self) -> T {
        self.update(|v| v + T::from(1u8))
    }
}

impl<T: Default + Copy + PartialOrd + Send + Sync> Default for Monitor<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
