use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::interval_at;
use tracing::debug;

use crate::constants::{DEFAULT_PROMISE_TTL, PROMISE_REAP_INTERVAL};

/// An intent to upload a value for a key. Holding a live promise grants a
/// single writer the exclusive right to PUT, keeping a stampede of clients
/// from fetching the same object from origin at once.
#[derive(Debug, Clone)]
pub struct Promise {
    pub key: String,
    /// Expected value size from the intent request, `-1` if not specified.
    pub size: i64,
    pub created_at: Instant,
    pub expires_at: Instant,
}

/// Per-key upload leases with TTL-based expiry.
///
/// Lookups take the shared side of the lock; expiry cleanup and writes take
/// the exclusive side. A background task reaps expired promises so abandoned
/// uploads cannot accumulate. Must be constructed inside a tokio runtime.
pub struct PromiseMap {
    promises: Arc<RwLock<HashMap<String, Promise>>>,
    stop_tx: watch::Sender<bool>,
}

impl PromiseMap {
    pub fn new() -> Self {
        Self::with_reap_interval(PROMISE_REAP_INTERVAL)
    }

    pub fn with_reap_interval(reap_interval: Duration) -> Self {
        let promises = Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(reap_loop(promises.clone(), stop_rx, reap_interval));
        Self { promises, stop_tx }
    }

    /// Create a promise for `key`. Returns `false` if a live promise already
    /// exists; an expired one is replaced. A zero `ttl` selects the default.
    pub fn create(&self, key: &str, size: i64, ttl: Duration) -> bool {
        let ttl = if ttl.is_zero() {
            DEFAULT_PROMISE_TTL
        } else {
            ttl
        };

        let now = Instant::now();
        let mut promises = self.promises.write();

        if let Some(existing) = promises.get(key) {
            if now < existing.expires_at {
                return false;
            }
            promises.remove(key);
        }

        promises.insert(
            key.to_string(),
            Promise {
                key: key.to_string(),
                size,
                created_at: now,
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Fetch the promise for `key`, or `None` if absent or expired. An
    /// expired promise observed here is deleted.
    pub fn get(&self, key: &str) -> Option<Promise> {
        {
            let promises = self.promises.read();
            let promise = promises.get(key)?;
            if Instant::now() < promise.expires_at {
                return Some(promise.clone());
            }
        }

        // Expired on the shared path: retake exclusively and recheck, since
        // another writer may have replaced it with a fresh promise.
        let mut promises = self.promises.write();
        let promise = promises.get(key)?;
        if promise.expires_at <= Instant::now() {
            promises.remove(key);
            return None;
        }
        Some(promise.clone())
    }

    /// Whether a live promise exists for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Release the promise after the upload resolved. Idempotent.
    pub fn fulfill(&self, key: &str) {
        self.promises.write().remove(key);
    }

    /// Remaining lifetime of the promise for `key`; zero if absent or
    /// expired.
    pub fn remaining_ttl(&self, key: &str) -> Duration {
        match self.get(key) {
            Some(promise) => promise.expires_at.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Number of extant promises, expired ones included until the next reap.
    pub fn len(&self) -> usize {
        self.promises.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background reaper. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Default for PromiseMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PromiseMap {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reap_loop(
    promises: Arc<RwLock<HashMap<String, Promise>>>,
    mut stop_rx: watch::Receiver<bool>,
    reap_interval: Duration,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + reap_interval, reap_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut promises = promises.write();
                let before = promises.len();
                promises.retain(|_, promise| now < promise.expires_at);
                let reaped = before - promises.len();
                if reaped > 0 {
                    debug!(reaped, "reaped expired promises");
                }
            }
            _ = stop_rx.changed() => return,
        }
    }
}
