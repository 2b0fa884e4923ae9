//! The pending-record store the batch engine reads its backlog from and reports progress to.
//!
//! Current implementations:
//! - sqlite (see `db.rs`)
//! - memory (for tests and dry runs)

use crate::records::{PendingRecord, RecordStatus};
use alloy::primitives::B256;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Dyn store handed to an engine
pub type PendingStoreService<R> = Arc<dyn PendingStore<R>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} does not exist")]
    NotFound(i64),
    #[error("record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: RecordStatus,
        to: RecordStatus,
    },
}

#[async_trait]
pub trait PendingStore<R: PendingRecord>: Send + Sync {
    /// Every record currently in `pending`, oldest first
    async fn get_pending(&self) -> eyre::Result<Vec<R>>;

    /// Move a record to `status`. Fails with [`StoreError::InvalidTransition`] on a regression.
    async fn update_status(
        &self,
        id: i64,
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> eyre::Result<()>;
}

/// In-memory [`PendingStore`]
pub struct MemStore<R> {
    records: Mutex<IndexMap<i64, R>>,
}

impl<R> Default for MemStore<R> {
    fn default() -> Self {
        MemStore {
            records: Mutex::new(IndexMap::new()),
        }
    }
}

impl<R: PendingRecord> MemStore<R> {
    pub fn new(records: impl IntoIterator<Item = R>) -> Self {
        MemStore {
            records: Mutex::new(records.into_iter().map(|r| (r.id(), r)).collect()),
        }
    }

    pub fn insert(&self, record: R) {
        self.records.lock().insert(record.id(), record);
    }

    pub fn get(&self, id: i64) -> Option<R> {
        self.records.lock().get(&id).cloned()
    }

    /// Put a record back to `pending`, as an operator does to re-queue a failed one
    pub fn requeue(&self, id: i64) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let state = record.state_mut();
        state.status = RecordStatus::Pending;
        state.tx_hash = None;
        state.batch_id = None;
        Ok(())
    }
}

#[async_trait]
impl<R: PendingRecord> PendingStore<R> for MemStore<R> {
    async fn get_pending(&self) -> eyre::Result<Vec<R>> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.status() == RecordStatus::Pending)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: i64,
        status: RecordStatus,
        tx_hash: Option<B256>,
        batch_id: Option<&str>,
    ) -> eyre::Result<()> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let from = record.status();
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from,
                to: status,
            }
            .into());
        }

        let state = record.state_mut();
        state.status = status;
        if tx_hash.is_some() {
            state.tx_hash = tx_hash;
        }
        if let Some(batch_id) = batch_id {
            state.batch_id = Some(batch_id.to_string());
        }
        Ok(())
    }
}
