//! [`HealthMonitor`] – periodic integrity and liveness report.
//!
//! A check walks every client's receipt chain, counts claims whose lease has
//! not been renewed within the stale threshold, and counts pending work.  A chain
//! mismatch marks the report unhealthy and is logged, but nothing stops:
//! tamper detection is advisory and task processing continues.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskgate_kernel::health::HealthMonitor;
//! use taskgate_store::Database;
//!
//! let db = Arc::new(Database::open_in_memory().unwrap());
//! let monitor = HealthMonitor::new(db, 500, Duration::from_secs(300));
//!
//! let report = monitor.check().unwrap();
//! assert!(report.healthy);
//! assert!(report.chains.is_empty());
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskgate_store::{Database, receipt_ledger, task_store};
use taskgate_types::{KernelError, TaskStatus, now};
use tracing::warn;

/// Verification result for one client chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHealth {
    pub client_id: String,
    pub valid: bool,
    pub checked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `false` when any chain failed verification.
    pub healthy: bool,
    pub chains: Vec<ChainHealth>,
    /// Claims whose lease is older than the stale threshold.
    pub stale_claims: usize,
    /// `pending` tasks across all clients.
    pub pending: usize,
}

pub struct HealthMonitor {
    db: Arc<Database>,
    verify_limit: usize,
    stale_after: Duration,
}

impl HealthMonitor {
    pub fn new(db: Arc<Database>, verify_limit: usize, stale_after: Duration) -> Self {
        Self {
            db,
            verify_limit,
            stale_after,
        }
    }

    /// Build a report.  Only storage failures are returned as errors.
    ///
    /// Each chain is verified under its own read, so dispatch passes can
    /// interleave with a long check.
    pub fn check(&self) -> Result<HealthReport, KernelError> {
        let mut chains = Vec::new();
        for client_id in self.db.read(receipt_ledger::client_ids)? {
            let verification = self
                .db
                .read(|conn| receipt_ledger::verify_chain(conn, &client_id, self.verify_limit))?;
            let checked = verification.checked;
            let valid = verification.valid;
            if let Err(err) = verification.into_result(&client_id) {
                warn!(error = %err, "receipt chain failed verification");
            }
            chains.push(ChainHealth {
                client_id,
                valid,
                checked,
            });
        }

        let stale_claims = match chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now().checked_sub_signed(age))
        {
            Some(cutoff) => self.db.read(|conn| task_store::stale_claims(conn, cutoff))?.len(),
            None => 0,
        };
        let pending = self.db.read(|conn| task_store::count_by_status(conn, TaskStatus::Pending))?;

        Ok(HealthReport {
            healthy: chains.iter().all(|chain| chain.valid),
            chains,
            stale_claims,
            pending,
        })
    }
}
