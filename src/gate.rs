//! Per-request serialization.
//!
//! Calls sharing a canonical key (method, path and sorted query) are
//! processed one at a time. Calls with different keys run concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::model::RequestData;

/// Canonical gate key for `request`.
#[must_use]
pub fn gate_key(request: &RequestData) -> String {
    format!("{} {}", request.method, request.canonical_url())
}

/// RAII permit; the key is released when this is dropped.
///
/// Dropping covers every exit path of the holder (success, error, panic).
#[derive(Debug)]
pub struct GatePermit {
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Key this permit holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Lazily populated map of single-permit semaphores.
///
/// Semaphores are kept for the life of the process.
#[derive(Debug, Default)]
pub struct ConcurrencyGate {
    permits: DashMap<String, Arc<Semaphore>>,
}

impl ConcurrencyGate {
    /// Creates an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the key's semaphore was closed.
    pub async fn acquire(&self, key: &str) -> Result<GatePermit, AcquireError> {
        let semaphore = Arc::clone(
            self.permits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .value(),
        );
        let permit = semaphore.acquire_owned().await?;
        Ok(GatePermit {
            key: key.to_string(),
            _permit: permit,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.permits.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn key_ignores_query_order() {
        let a = RequestData::new("get", "/x?b=2&a=1");
        let b = RequestData::new("GET", "/x?a=1&b=2");
        assert_eq!(gate_key(&a), gate_key(&b));
        assert_ne!(gate_key(&a), gate_key(&RequestData::new("POST", "/x?a=1&b=2")));
    }

    #[tokio::test]
    async fn same_key_waits_for_release() {
        let gate = Arc::new(ConcurrencyGate::new());
        let held = gate.acquire("GET /x").await.unwrap();
        assert_eq!(held.key(), "GET /x");

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire("GET /x").await.map(|p| p.key().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let key = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(key, "GET /x");
        assert_eq!(gate.len(), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let gate = ConcurrencyGate::new();
        let _a = gate.acquire("GET /a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), gate.acquire("GET /b")).await;
        assert!(b.is_ok());
        assert_eq!(gate.len(), 2);
    }
}
