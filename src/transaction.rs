//! Write transactions. Writes are asynchronous: the RPC layer enqueues them
//! and hands the caller a transaction ID, the scheduler performs them, and
//! the [`TransactionTracker`] records their state so callers can poll for
//! completion. Transaction state only ever advances; a reaper removes
//! terminal transactions once they have outlived the configured TTL.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::v3 as api;

/// The state of a write transaction. States advance monotonically:
/// `Pending -> Writing -> {Done, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// The write is queued but not yet picked up by the scheduler.
    Pending,
    /// The scheduler has handed the write to the device handler.
    Writing,
    /// The write completed successfully. Terminal.
    Done,
    /// The write failed. Terminal.
    Error,
}

impl WriteState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteState::Done | WriteState::Error)
    }

    // Position in the state order, used to refuse backward transitions. The
    // two terminal states share a rank.
    fn rank(&self) -> u8 {
        match self {
            WriteState::Pending => 0,
            WriteState::Writing => 1,
            WriteState::Done | WriteState::Error => 2,
        }
    }

    fn to_rpc(self) -> api::WriteStatus {
        match self {
            WriteState::Pending => api::WriteStatus::Pending,
            WriteState::Writing => api::WriteStatus::Writing,
            WriteState::Done => api::WriteStatus::Done,
            WriteState::Error => api::WriteStatus::Error,
        }
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteState::Pending => "pending",
            WriteState::Writing => "writing",
            WriteState::Done => "done",
            WriteState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// The payload of a single write: an action and its raw data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteData {
    /// What to do, e.g. "color" or "state".
    pub action: String,
    /// The data for the action, e.g. "ff0000" or "on".
    pub data: String,
}

impl WriteData {
    pub(crate) fn from_rpc(data: api::WriteData) -> Self {
        WriteData {
            action: data.action,
            data: data.data,
        }
    }

    pub(crate) fn to_rpc(&self) -> api::WriteData {
        api::WriteData {
            action: self.action.clone(),
            data: self.data.clone(),
        }
    }
}

/// The record of a single asynchronous write.
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    /// The opaque ID callers poll with.
    pub id: String,
    /// The device the write targets.
    pub device_id: String,
    /// What is being written.
    pub context: WriteData,
    /// The current state.
    pub state: WriteState,
    /// A human-readable message, set when the write errors.
    pub message: String,
    /// When the transaction was created.
    pub created: DateTime<Utc>,
    /// When the transaction last changed state.
    pub updated: DateTime<Utc>,
}

impl WriteTransaction {
    pub(crate) fn to_rpc(&self) -> api::TransactionStatus {
        api::TransactionStatus {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            context: Some(self.context.to_rpc()),
            status: self.state.to_rpc() as i32,
            message: self.message.clone(),
            created: self.created.to_rfc3339(),
            updated: self.updated.to_rfc3339(),
        }
    }
}

/// Tracks every live write transaction by ID.
#[derive(Clone)]
pub struct TransactionTracker {
    inner: Arc<RwLock<HashMap<String, WriteTransaction>>>,
    ttl: Duration,
}

impl TransactionTracker {
    /// Returns a new tracker whose reaper removes terminal transactions
    /// older than `ttl`.
    pub fn new(ttl: Duration) -> Self {
        TransactionTracker {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Creates and tracks a new pending transaction for a write against the
    /// given device.
    pub async fn create(&self, device_id: &str, context: WriteData) -> WriteTransaction {
        let now = Utc::now();
        let transaction = WriteTransaction {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            context,
            state: WriteState::Pending,
            message: String::new(),
            created: now,
            updated: now,
        };
        self.inner
            .write()
            .await
            .insert(transaction.id.clone(), transaction.clone());
        transaction
    }

    /// Looks up a transaction by ID. Returns `None` for unknown or reaped
    /// transactions.
    pub async fn get(&self, id: &str) -> Option<WriteTransaction> {
        self.inner.read().await.get(id).cloned()
    }

    /// Advances a transaction to a new state, stamping its `updated` time.
    /// Backward transitions are refused so that an observer never sees state
    /// regress.
    pub async fn set_state(&self, id: &str, state: WriteState, message: Option<String>) {
        let mut lock = self.inner.write().await;
        let transaction = match lock.get_mut(id) {
            Some(transaction) => transaction,
            None => {
                // Reaped (or never existed); nothing to update.
                debug!(transaction = %id, "cannot update state of unknown transaction");
                return;
            }
        };
        if state.rank() <= transaction.state.rank() {
            warn!(
                transaction = %id,
                from = %transaction.state,
                to = %state,
                "refusing backward transaction state transition"
            );
            return;
        }
        transaction.state = state;
        transaction.updated = Utc::now();
        if let Some(message) = message {
            transaction.message = message;
        }
    }

    /// Removes every terminal transaction whose last update is older than
    /// the TTL.
    pub async fn reap(&self) {
        let horizon = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        let now = Utc::now();
        let mut lock = self.inner.write().await;
        let before = lock.len();
        lock.retain(|_, transaction| {
            !(transaction.state.is_terminal() && now - transaction.updated > horizon)
        });
        let reaped = before - lock.len();
        if reaped > 0 {
            debug!(count = %reaped, "reaped terminal transactions");
        }
    }

    /// Periodically reaps until shutdown is signalled.
    pub(crate) async fn run_reaper(self, mut shutdown: watch::Receiver<bool>) {
        let interval = std::cmp::max(self.ttl / 2, Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.reap().await;
        }
        debug!("transaction reaper stopped");
    }
}
