//! Bounds the number of expensive fetches running at the same time.
//!
//! The controller is shared by all orchestrators of a client, so that e.g. textures and
//! scene metadata compete for the same budget.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LoadingConfig;
use crate::error::LoadError;

/// Hands out a limited number of [`BudgetHandle`]s.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionController {
    /// Creates a controller admitting `limit` concurrent loads, at least one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn from_config(config: &LoadingConfig) -> Self {
        Self::new(config.max_concurrent_loads)
    }

    /// Takes one unit of budget if any is left.
    ///
    /// Exhaustion is not an error, the caller is expected to try again on a later tick.
    pub fn try_acquire(&self) -> Option<BudgetHandle> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                metric!(gauge("loading.budget.in_flight") = self.in_flight() as u64);
                Some(BudgetHandle::new(permit))
            }
            Err(_) => {
                metric!(counter("loading.admission.denied") += 1);
                None
            }
        }
    }

    /// Waits until one unit of budget is available.
    pub async fn acquire(&self) -> Result<BudgetHandle, LoadError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(LoadError::from_std_error)?;
        metric!(gauge("loading.budget.in_flight") = self.in_flight() as u64);
        Ok(BudgetHandle::new(permit))
    }

    /// The number of handles currently holding budget.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("in_flight", &self.in_flight())
            .field("limit", &self.limit)
            .finish()
    }
}

/// One unit of admission budget.
///
/// Clones refer to the same unit. It is given back on the first call to
/// [`release`](Self::release), or when the last clone is dropped.
#[derive(Clone)]
pub struct BudgetHandle {
    permit: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl BudgetHandle {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Arc::new(Mutex::new(Some(permit))),
        }
    }

    /// Gives the budget back. Returns `true` if this call released it.
    pub fn release(&self) -> bool {
        let permit = match self.permit.lock() {
            Ok(mut permit) => permit.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        permit.is_some()
    }

    pub fn is_released(&self) -> bool {
        match self.permit.lock() {
            Ok(permit) => permit.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for BudgetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetHandle")
            .field("released", &self.is_released())
            .finish()
    }
}
