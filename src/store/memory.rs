//! In-memory transactional store.
//!
//! The reference implementation of the assumed persistence service. A
//! transaction stages its writes on a clone of the table set and swaps it in
//! only on success, so an aborted step leaves nothing behind (the atomicity
//! guarantee the step pipeline builds on). The single mutex doubles as the
//! row-level lock that serializes steps.

use std::sync::{Arc, Mutex};

use crate::store::StoreData;
use crate::types::{Error, Result};

/// Cloneable handle over the shared table set.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure inside a transaction. On `Ok` the staged table set
    /// replaces the live one; on `Err` every staged write is discarded.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        let mut staged = guard.clone();
        match f(&mut staged) {
            Ok(value) => {
                *guard = staged;
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    /// Read-only access without staging.
    pub fn read<T>(&self, f: impl FnOnce(&StoreData) -> Result<T>) -> Result<T> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        f(&guard)
    }
}
