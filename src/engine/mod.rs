mod availability;
mod error;
mod guard;
mod lifecycle;
mod lookup;
mod management;
mod slots;
mod store;

pub use availability::annotate;
pub use error::EngineError;
pub use guard::{BookingRequest, GuestDetails, validate_guest};
pub use lifecycle::{RolePolicy, TransitionPolicy, allowed_targets, check_transition};
pub use slots::{generate_slots, price_multiplier, slot_price};
pub use store::{BookingStore, LedgerStore, StoreError};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::directory::Directory;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalHandle};

pub struct Engine {
    pub(super) directory: Arc<Directory>,
    pub(super) store: Arc<dyn BookingStore>,
    pub(super) wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: Arc<dyn TransitionPolicy>,
    /// Held shared by every commit, exclusively by compaction.
    gate: Arc<RwLock<()>>,
}

impl Engine {
    /// Open the journal at `wal_path` and rebuild the catalogue and reservations from it.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);
        let store = Arc::new(LedgerStore::restore(wal.clone(), &events));
        let engine = Self::assemble(wal, store, notify);
        events.iter().for_each(|e| engine.directory.apply(e));
        tracing::debug!(path = %wal_path.display(), events = events.len(), "journal replayed");
        Ok(engine)
    }

    /// Journal the catalogue at `wal_path` but keep reservations in `store`.
    pub fn with_store(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        store: Arc<dyn BookingStore>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);
        let engine = Self::assemble(wal, store, notify);
        events.iter().for_each(|e| engine.directory.apply(e));
        Ok(engine)
    }

    fn assemble(wal: WalHandle, store: Arc<dyn BookingStore>, notify: Arc<NotifyHub>) -> Self {
        Self {
            directory: Arc::new(Directory::new()),
            store,
            wal,
            notify,
            policy: Arc::new(RolePolicy),
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn TransitionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Idempotent store read, retried with linear backoff while the store reports
    /// itself unavailable.
    pub(super) async fn read_store<T, F, Fut>(
        &self,
        op: &'static str,
        mut call: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(StoreError::Unavailable(reason)) if attempt < STORE_READ_ATTEMPTS => {
                    metrics::counter!(crate::observability::STORE_READ_RETRIES_TOTAL, "op" => op)
                        .increment(1);
                    tracing::warn!(op, attempt, "store read failed, retrying: {reason}");
                    tokio::time::sleep(Duration::from_millis(
                        STORE_READ_BACKOFF_MS * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                other => return other.map_err(EngineError::from),
            }
        }
    }

    /// Run a commit on its own task so a caller that stops waiting cannot cut it
    /// short between the journal append and the in-memory apply.
    pub(super) async fn detached<F>(&self, commit: F) -> Result<F::Output, EngineError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let gate = self.gate.clone();
        tokio::spawn(async move {
            let _shared = gate.read_owned().await;
            commit.await
        })
        .await
        .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))
    }

    /// Rewrite the journal as a snapshot of the current state. Commits wait
    /// until it is done, so nothing appended meanwhile can be lost.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _exclusive = self.gate.write().await;
        let mut events = self.directory.snapshot();
        events.extend(self.store.snapshot().await);
        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal
            .appends_since_compact()
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
