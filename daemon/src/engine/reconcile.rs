//! Retry policy for transfers that ended badly.
//!
//! Nothing re-enqueues a failed or interrupted transfer on its own. The
//! periodic sweep asks this policy which of them are due and hands those back
//! to `new`, where the regular pending-work path picks them up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::{
	models::{TransferRecord, TransferStatus},
	RetryConfig,
};
use tracing::{debug, info};

use crate::store::{LocalStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Retries granted per transfer; 0 turns automatic retries off.
	pub max_attempts: u32,
	pub base_backoff: Duration,
	pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
	fn from(config: &RetryConfig) -> Self {
		Self {
			max_attempts: config.max_attempts,
			base_backoff: Duration::from_secs(config.base_backoff_secs),
			max_backoff: Duration::from_secs(config.max_backoff_secs),
		}
	}
}

impl RetryPolicy {
	/// Wait before the retry that follows `attempts` earlier retries.
	/// The first retry is immediate, then `base * 2^(n-1)` up to the cap.
	pub fn backoff(&self, attempts: u32) -> Duration {
		if attempts == 0 {
			return Duration::ZERO;
		}
		let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
		self.base_backoff
			.checked_mul(factor)
			.unwrap_or(self.max_backoff)
			.min(self.max_backoff)
	}

	pub fn is_due(&self, record: &TransferRecord, now: DateTime<Utc>) -> bool {
		if !record.status.is_retryable() || record.attempts >= self.max_attempts {
			return false;
		}
		let waited = (now - record.updated_at).to_std().unwrap_or(Duration::ZERO);
		waited >= self.backoff(record.attempts)
	}
}

/// Hand every due failed/interrupted transfer back to `new`.
/// Returns how many were reset.
pub async fn reset_retryable(store: &LocalStore, policy: &RetryPolicy, now: DateTime<Utc>) -> Result<usize, StoreError> {
	if policy.max_attempts == 0 {
		return Ok(0);
	}

	let candidates = store
		.list_transfers_with_status(&[TransferStatus::Failed, TransferStatus::Interrupted])
		.await?;

	let mut reset = 0;
	for record in candidates.iter().filter(|r| policy.is_due(r, now)) {
		match store.reset_transfer(&record.id).await {
			Ok(updated) => {
				info!(transfer = %record.id, from = %record.status, attempt = updated.attempts, "retrying transfer");
				reset += 1;
			}
			// Someone else moved it since we listed it.
			Err(StoreError::InvalidTransition { .. }) => debug!(transfer = %record.id, "transfer no longer retryable"),
			Err(e) => return Err(e),
		}
	}
	Ok(reset)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db;

	fn policy() -> RetryPolicy {
		RetryPolicy {
			max_attempts: 3,
			base_backoff: Duration::from_secs(30),
			max_backoff: Duration::from_secs(100),
		}
	}

	fn record(status: TransferStatus, attempts: u32, age_secs: i64) -> TransferRecord {
		let mut record = TransferRecord::new("t1", "f", "d");
		record.status = status;
		record.attempts = attempts;
		record.updated_at = Utc::now() - chrono::Duration::seconds(age_secs);
		record
	}

	#[test]
	fn backoff_doubles_up_to_cap() {
		let p = policy();
		assert_eq!(p.backoff(0), Duration::ZERO);
		assert_eq!(p.backoff(1), Duration::from_secs(30));
		assert_eq!(p.backoff(2), Duration::from_secs(60));
		assert_eq!(p.backoff(3), Duration::from_secs(100));
		assert_eq!(p.backoff(40), Duration::from_secs(100));
	}

	#[test]
	fn due_only_when_retryable_under_limit_and_waited() {
		let p = policy();
		let now = Utc::now();
		assert!(p.is_due(&record(TransferStatus::Failed, 0, 0), now));
		assert!(p.is_due(&record(TransferStatus::Interrupted, 1, 31), now));
		assert!(!p.is_due(&record(TransferStatus::Failed, 1, 5), now));
		assert!(!p.is_due(&record(TransferStatus::Failed, 3, 10_000), now));
		assert!(!p.is_due(&record(TransferStatus::Complete, 0, 10_000), now));
		assert!(!p.is_due(&record(TransferStatus::New, 0, 10_000), now));
	}

	#[tokio::test]
	async fn resets_due_records_only() {
		let store = LocalStore::new(db::memory().await.unwrap());
		let mut fresh_failure = TransferRecord::new("fresh", "f", "d");
		fresh_failure.status = TransferStatus::Failed;
		let mut exhausted = TransferRecord::new("exhausted", "f", "d");
		exhausted.status = TransferStatus::Failed;
		exhausted.attempts = 3;
		let mut backing_off = TransferRecord::new("backing-off", "f", "d");
		backing_off.status = TransferStatus::Interrupted;
		backing_off.attempts = 1;
		store.upsert_transfers(vec![fresh_failure, exhausted, backing_off]).await;

		assert_eq!(reset_retryable(&store, &policy(), Utc::now()).await.unwrap(), 1);

		let fresh = store.get_transfer("fresh").await.unwrap();
		assert_eq!(fresh.status, TransferStatus::New);
		assert_eq!(fresh.attempts, 1);
		assert_eq!(store.get_transfer("exhausted").await.unwrap().status, TransferStatus::Failed);
		assert_eq!(store.get_transfer("backing-off").await.unwrap().status, TransferStatus::Interrupted);

		// Later on, the backed-off one comes due as well.
		let later = Utc::now() + chrono::Duration::seconds(31);
		assert_eq!(reset_retryable(&store, &policy(), later).await.unwrap(), 1);
		assert_eq!(store.get_transfer("backing-off").await.unwrap().status, TransferStatus::New);
	}

	#[tokio::test]
	async fn zero_attempts_disables_retries() {
		let store = LocalStore::new(db::memory().await.unwrap());
		let mut failed = TransferRecord::new("t1", "f", "d");
		failed.status = TransferStatus::Failed;
		store.upsert_transfers(vec![failed]).await;

		let off = RetryPolicy { max_attempts: 0, ..policy() };
		assert_eq!(reset_retryable(&store, &off, Utc::now()).await.unwrap(), 0);
		assert_eq!(store.get_transfer("t1").await.unwrap().status, TransferStatus::Failed);
	}
}
