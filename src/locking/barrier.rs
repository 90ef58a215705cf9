//! Pending-operation barrier.
//!
//! After a topology change a key may get a new primary owner while
//! transactions that started under the old topology still write it. Before
//! taking a real lock, a transaction waits for those older transactions to
//! finish, using the same timeout budget as the lock itself.

use crate::core::error::{GridError, GridResult};
use crate::core::ids::Key;
use crate::locking::transaction::CacheTransaction;
use crate::locking::tx_table::TransactionTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct PendingLockManager {
    transactions: Arc<TransactionTable>,
}

impl PendingLockManager {
    pub fn new(transactions: Arc<TransactionTable>) -> Self {
        Self { transactions }
    }

    /// Wait for older-topology transactions writing `key`; returns the remaining budget.
    pub async fn await_pending_transactions_for_key(
        &self,
        tx: &CacheTransaction,
        key: &Key,
        timeout: Duration,
    ) -> GridResult<Duration> {
        self.await_pending_transactions_for_all_keys(tx, std::slice::from_ref(key), timeout)
            .await
    }

    /// Wait for older-topology transactions writing any of `keys`; returns the remaining budget.
    pub async fn await_pending_transactions_for_all_keys(
        &self,
        tx: &CacheTransaction,
        keys: &[Key],
        timeout: Duration,
    ) -> GridResult<Duration> {
        let topology_id = tx.topology_id();
        if self
            .transactions
            .min_topology_id()
            .map_or(true, |min| min >= topology_id)
        {
            return Ok(timeout);
        }

        let pending: Vec<(Arc<CacheTransaction>, Key)> = self
            .transactions
            .older_than(topology_id)
            .into_iter()
            .filter(|other| other.gtx() != tx.gtx())
            .filter_map(|other| {
                let key = keys.iter().find(|key| other.touches_key(key))?.clone();
                Some((other, key))
            })
            .collect();
        if pending.is_empty() {
            return Ok(timeout);
        }

        let deadline = Instant::now() + timeout;
        for (other, key) in pending {
            tracing::debug!(
                tx = %tx.gtx(),
                pending_tx = %other.gtx(),
                topology_id,
                "waiting for transaction from older topology"
            );
            if tokio::time::timeout_at(deadline, other.wait_finished())
                .await
                .is_err()
            {
                return Err(GridError::lock_timeout(
                    &key,
                    &tx.lock_owner(),
                    timeout.as_millis() as u64,
                ));
            }
        }
        Ok(deadline.saturating_duration_since(Instant::now()))
    }
}
