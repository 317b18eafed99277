use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::LoadError;
use crate::intention::CacheKey;

/// Errors of keys for which every permitted source failed.
///
/// A memoized key is answered with its error without any fetch, until it is explicitly
/// invalidated.
#[derive(Debug, Default)]
pub struct IrrecoverableFailures {
    failures: Mutex<HashMap<CacheKey, LoadError>>,
}

impl IrrecoverableFailures {
    pub fn get(&self, key: &CacheKey) -> Option<LoadError> {
        self.failures.lock().unwrap().get(key).cloned()
    }

    /// Memoizes `error` for `key`.
    ///
    /// Returns `false` and keeps the first error if `key` was already memoized.
    pub fn set(&self, key: CacheKey, error: LoadError) -> bool {
        let mut failures = self.failures.lock().unwrap();
        if let Some(existing) = failures.get(&key) {
            tracing::warn!(%key, %existing, "Irrecoverable failure was already recorded");
            return false;
        }
        failures.insert(key, error);
        true
    }

    /// Forgets the failure of `key`, so it can be fetched again.
    pub fn invalidate(&self, key: &CacheKey) -> Option<LoadError> {
        self.failures.lock().unwrap().remove(key)
    }

    pub fn clear(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
