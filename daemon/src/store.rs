//! Durable local state: cached file records, their transfer records, and a
//! live change feed over the file records.

use std::{
	collections::{HashSet, VecDeque},
	sync::Arc,
};

use chrono::{DateTime, Utc};
use ferry_core::models::{FileRecord, TransferRecord, TransferStatus};
use surrealdb::types::SurrealValue;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::db::DbHandle;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// What [`LocalStore::recover_interrupted`] found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
	pub requeued: usize,
	pub interrupted: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("record not found: {0}")]
	NotFound(String),

	#[error("stale revision for {id}: caller has {expected:?}, store has {found:?}")]
	Conflict {
		id: String,
		expected: Option<u64>,
		found: Option<u64>,
	},

	#[error("transfer {id} cannot move from {from} to {to}")]
	InvalidTransition {
		id: String,
		from: TransferStatus,
		to: TransferStatus,
	},

	#[error("storage error: {0}")]
	Io(String),

	#[error("malformed record {id}: {reason}")]
	Decode { id: String, reason: String },
}

impl From<surrealdb::Error> for StoreError {
	fn from(err: surrealdb::Error) -> Self {
		StoreError::Io(err.to_string())
	}
}

/// One entry of the file-record change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
	pub record: FileRecord,
	pub deleted: bool,
}

/// Keyed store for file and transfer records.
///
/// Reads run concurrently; every write goes through one writer lock so
/// read-check-write sequences (revision checks, forward-only transitions)
/// are serialized. Clone is cheap.
#[derive(Clone)]
pub struct LocalStore {
	db: DbHandle,
	write_lock: Arc<Mutex<()>>,
	changes: broadcast::Sender<ChangeEvent>,
}

#[derive(Debug, Clone, SurrealValue)]
struct FileRow {
	local_id: String,
	remote_id: String,
	source_id: String,
	relative_path: String,
	size: i64,
	mod_time: i64,
	content_hash: String,
	revision: i64,
}

impl FileRow {
	fn into_record(self) -> FileRecord {
		FileRecord {
			id: self.local_id,
			remote_id: self.remote_id,
			source_id: self.source_id,
			relative_path: self.relative_path,
			size: self.size.max(0) as u64,
			mod_time: self.mod_time,
			content_hash: self.content_hash,
			revision: Some(self.revision.max(0) as u64),
		}
	}
}

#[derive(Debug, Clone, SurrealValue)]
struct TransferRow {
	transfer_id: String,
	file_local_id: String,
	destination_id: String,
	status: String,
	bytes_transferred: i64,
	attempts: i64,
	created_at: i64,
	updated_at: i64,
}

impl TransferRow {
	fn into_record(self) -> Result<TransferRecord, StoreError> {
		let status = self.status.parse::<TransferStatus>().map_err(|e| StoreError::Decode {
			id: self.transfer_id.clone(),
			reason: e.to_string(),
		})?;
		Ok(TransferRecord {
			id: self.transfer_id,
			file_local_id: self.file_local_id,
			destination_id: self.destination_id,
			status,
			bytes_transferred: self.bytes_transferred.max(0) as u64,
			attempts: self.attempts.clamp(0, u32::MAX as i64) as u32,
			created_at: from_millis(self.created_at),
			updated_at: from_millis(self.updated_at),
		})
	}
}

#[derive(Debug, Clone, SurrealValue)]
struct StatusCountRow {
	status: String,
	total: i64,
}

const SELECT_FILE: &str = "SELECT local_id, remote_id, source_id, relative_path, size, mod_time, content_hash, revision
     FROM cached_file WHERE local_id = $local_id";

const CREATE_FILE: &str = "CREATE cached_file CONTENT {
        local_id: $local_id,
        remote_id: $remote_id,
        source_id: $source_id,
        relative_path: $relative_path,
        size: $size,
        mod_time: $mod_time,
        content_hash: $content_hash,
        revision: $revision,
    }";

const UPDATE_FILE: &str = "UPDATE cached_file SET
        remote_id = $remote_id,
        source_id = $source_id,
        relative_path = $relative_path,
        size = $size,
        mod_time = $mod_time,
        content_hash = $content_hash,
        revision = $revision
     WHERE local_id = $local_id";

const SELECT_TRANSFER: &str = "SELECT transfer_id, file_local_id, destination_id, status, bytes_transferred, attempts, created_at, updated_at
     FROM file_transfer WHERE transfer_id = $transfer_id";

const SELECT_TRANSFERS_FOR_FILE: &str = "SELECT transfer_id, file_local_id, destination_id, status, bytes_transferred, attempts, created_at, updated_at
     FROM file_transfer WHERE file_local_id = $file_local_id ORDER BY created_at ASC";

const SELECT_TRANSFERS_BY_STATUS: &str = "SELECT transfer_id, file_local_id, destination_id, status, bytes_transferred, attempts, created_at, updated_at
     FROM file_transfer WHERE status IN $statuses ORDER BY created_at ASC";

const CREATE_TRANSFER: &str = "CREATE file_transfer CONTENT {
        transfer_id: $transfer_id,
        file_local_id: $file_local_id,
        destination_id: $destination_id,
        status: $status,
        bytes_transferred: $bytes_transferred,
        attempts: $attempts,
        created_at: $created_at,
        updated_at: $updated_at,
    }";

const UPDATE_TRANSFER: &str = "UPDATE file_transfer SET
        file_local_id = $file_local_id,
        destination_id = $destination_id,
        status = $status,
        bytes_transferred = $bytes_transferred,
        attempts = $attempts,
        created_at = $created_at,
        updated_at = $updated_at
     WHERE transfer_id = $transfer_id";

impl LocalStore {
	pub fn new(db: DbHandle) -> Self {
		Self::with_feed_capacity(db, CHANGE_FEED_CAPACITY)
	}

	/// Store whose change feed buffers at most `capacity` unread events per subscriber.
	pub fn with_feed_capacity(db: DbHandle, capacity: usize) -> Self {
		let (changes, _) = broadcast::channel(capacity.max(1));
		Self { db, write_lock: Arc::new(Mutex::new(())), changes }
	}

	// ─── File records ─────────────────────────────────────────────

	/// Insert or update a file record by id.
	///
	/// The caller's `revision` must match the stored one (`None` for a record the
	/// store has never seen). Emits a change event once the write is durable.
	pub async fn upsert_file(&self, record: FileRecord) -> Result<FileRecord, StoreError> {
		let _guard = self.write_lock.lock().await;

		let current = self.find_file(&record.id).await?;
		let found = current.as_ref().and_then(|c| c.revision);
		if found != record.revision {
			return Err(StoreError::Conflict { id: record.id, expected: record.revision, found });
		}

		let revision = found.unwrap_or(0) + 1;
		let sql = if current.is_some() { UPDATE_FILE } else { CREATE_FILE };
		self.db
			.db
			.query(sql)
			.bind(("local_id", record.id.clone()))
			.bind(("remote_id", record.remote_id.clone()))
			.bind(("source_id", record.source_id.clone()))
			.bind(("relative_path", record.relative_path.clone()))
			.bind(("size", record.size as i64))
			.bind(("mod_time", record.mod_time))
			.bind(("content_hash", record.content_hash.clone()))
			.bind(("revision", revision as i64))
			.await?
			.check()?;

		let stored = FileRecord { revision: Some(revision), ..record };
		debug!(file = %stored.id, revision, "cached file record");

		// No subscribers is fine; the startup sweep covers anything missed.
		let _ = self.changes.send(ChangeEvent { record: stored.clone(), deleted: false });
		Ok(stored)
	}

	pub async fn get_file(&self, id: &str) -> Result<FileRecord, StoreError> {
		self.find_file(id).await?.ok_or_else(|| StoreError::NotFound(id.to_string()))
	}

	/// Delete a file record. Not used by the agent itself; provided for
	/// external cleanup tooling. Subscribers see a `deleted` event.
	pub async fn remove_file(&self, id: &str) -> Result<FileRecord, StoreError> {
		let _guard = self.write_lock.lock().await;

		let record = self.get_file(id).await?;
		self.db
			.db
			.query("DELETE cached_file WHERE local_id = $local_id")
			.bind(("local_id", id.to_string()))
			.await?
			.check()?;

		let _ = self.changes.send(ChangeEvent { record: record.clone(), deleted: true });
		Ok(record)
	}

	async fn find_file(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
		let mut response = self.db.db.query(SELECT_FILE).bind(("local_id", id.to_string())).await?;
		let rows: Vec<FileRow> = response.take(0)?;
		Ok(rows.into_iter().next().map(FileRow::into_record))
	}

	// ─── Transfer records ─────────────────────────────────────────

	pub async fn get_transfer(&self, id: &str) -> Result<TransferRecord, StoreError> {
		self.find_transfer(id).await?.ok_or_else(|| StoreError::NotFound(id.to_string()))
	}

	/// Every transfer record pointing at the given file, oldest first.
	pub async fn list_transfers_for_file(&self, file_local_id: &str) -> Result<Vec<TransferRecord>, StoreError> {
		let mut response = self
			.db
			.db
			.query(SELECT_TRANSFERS_FOR_FILE)
			.bind(("file_local_id", file_local_id.to_string()))
			.await?;
		let rows: Vec<TransferRow> = response.take(0)?;
		rows.into_iter().map(TransferRow::into_record).collect()
	}

	/// Transfer records in any of the given statuses, oldest first.
	pub async fn list_transfers_with_status(
		&self,
		statuses: &[TransferStatus],
	) -> Result<Vec<TransferRecord>, StoreError> {
		let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
		let mut response = self.db.db.query(SELECT_TRANSFERS_BY_STATUS).bind(("statuses", names)).await?;
		let rows: Vec<TransferRow> = response.take(0)?;
		rows.into_iter().map(TransferRow::into_record).collect()
	}

	/// Batch upsert. Each record succeeds or fails on its own; the result is
	/// index-aligned with the input.
	///
	/// Existing records keep their `created_at` and `attempts`, and keep their
	/// status and byte count when the incoming status would move them backwards.
	pub async fn upsert_transfers(&self, records: Vec<TransferRecord>) -> Vec<Result<TransferRecord, StoreError>> {
		let _guard = self.write_lock.lock().await;

		let mut results = Vec::with_capacity(records.len());
		for record in records {
			results.push(self.upsert_transfer_locked(record).await);
		}
		results
	}

	async fn upsert_transfer_locked(&self, mut record: TransferRecord) -> Result<TransferRecord, StoreError> {
		let existing = self.find_transfer(&record.id).await?;
		if let Some(existing) = &existing {
			record.created_at = existing.created_at;
			record.attempts = existing.attempts;
			if existing.status != record.status && !existing.status.can_advance_to(record.status) {
				record.status = existing.status;
				record.bytes_transferred = existing.bytes_transferred;
			}
		}
		record.updated_at = Utc::now();
		self.put_transfer(&record, existing.is_some()).await?;
		Ok(record)
	}

	/// Move a transfer forward in its lifecycle.
	///
	/// Returns `Ok(None)` when the transition would go backwards or leave a
	/// terminal status; the stored record is untouched in that case. Byte
	/// counts never decrease.
	pub async fn advance_transfer(
		&self,
		id: &str,
		status: TransferStatus,
		bytes_transferred: u64,
	) -> Result<Option<TransferRecord>, StoreError> {
		let _guard = self.write_lock.lock().await;

		let mut record = self.get_transfer(id).await?;
		if !record.status.can_advance_to(status) {
			debug!(transfer = id, from = %record.status, to = %status, "ignoring backward transition");
			return Ok(None);
		}

		record.status = status;
		record.bytes_transferred = record.bytes_transferred.max(bytes_transferred);
		record.updated_at = Utc::now();
		self.put_transfer(&record, true).await?;
		Ok(Some(record))
	}

	/// Hand a failed or interrupted transfer back to `new`. This is the only
	/// way out of those statuses and counts as one retry attempt.
	pub async fn reset_transfer(&self, id: &str) -> Result<TransferRecord, StoreError> {
		let _guard = self.write_lock.lock().await;

		let mut record = self.get_transfer(id).await?;
		if !record.status.is_retryable() {
			return Err(StoreError::InvalidTransition {
				id: id.to_string(),
				from: record.status,
				to: TransferStatus::New,
			});
		}

		record.status = TransferStatus::New;
		record.bytes_transferred = 0;
		record.attempts = record.attempts.saturating_add(1);
		record.updated_at = Utc::now();
		self.put_transfer(&record, true).await?;
		Ok(record)
	}

	/// Settle transfers a previous process left behind. Run once at startup,
	/// before any queue exists.
	///
	/// `queued` records never reached a transfer method, so they go back to
	/// `new` as they were. Records caught mid-upload become `interrupted`.
	pub async fn recover_interrupted(&self) -> Result<Recovery, StoreError> {
		let _guard = self.write_lock.lock().await;

		let orphans = self.list_transfers_with_status(&TransferStatus::IN_FLIGHT).await?;
		let now = Utc::now();
		let mut recovery = Recovery::default();
		for mut record in orphans {
			if record.status == TransferStatus::Queued {
				debug!(transfer = %record.id, "transfer was waiting at shutdown; back to new");
				record.status = TransferStatus::New;
				recovery.requeued += 1;
			} else {
				warn!(transfer = %record.id, status = %record.status, "transfer was in flight at shutdown; marking interrupted");
				record.status = TransferStatus::Interrupted;
				recovery.interrupted += 1;
			}
			record.updated_at = now;
			self.put_transfer(&record, true).await?;
		}
		Ok(recovery)
	}

	/// Number of transfer records per status.
	pub async fn status_counts(&self) -> Result<Vec<(TransferStatus, u64)>, StoreError> {
		let mut response = self
			.db
			.db
			.query("SELECT status, count() AS total FROM file_transfer GROUP BY status")
			.await?;
		let rows: Vec<StatusCountRow> = response.take(0)?;

		let mut counts = Vec::with_capacity(rows.len());
		for row in rows {
			let status = row.status.parse::<TransferStatus>().map_err(|e| StoreError::Decode {
				id: "status_counts".into(),
				reason: e.to_string(),
			})?;
			counts.push((status, row.total.max(0) as u64));
		}
		counts.sort_by_key(|(status, _)| TransferStatus::ALL.iter().position(|s| s == status));
		Ok(counts)
	}

	async fn find_transfer(&self, id: &str) -> Result<Option<TransferRecord>, StoreError> {
		let mut response = self.db.db.query(SELECT_TRANSFER).bind(("transfer_id", id.to_string())).await?;
		let rows: Vec<TransferRow> = response.take(0)?;
		rows.into_iter().next().map(TransferRow::into_record).transpose()
	}

	async fn put_transfer(&self, record: &TransferRecord, exists: bool) -> Result<(), StoreError> {
		let sql = if exists { UPDATE_TRANSFER } else { CREATE_TRANSFER };
		self.db
			.db
			.query(sql)
			.bind(("transfer_id", record.id.clone()))
			.bind(("file_local_id", record.file_local_id.clone()))
			.bind(("destination_id", record.destination_id.clone()))
			.bind(("status", record.status.as_str().to_string()))
			.bind(("bytes_transferred", record.bytes_transferred as i64))
			.bind(("attempts", record.attempts as i64))
			.bind(("created_at", record.created_at.timestamp_millis()))
			.bind(("updated_at", record.updated_at.timestamp_millis()))
			.await?
			.check()?;
		Ok(())
	}

	// ─── Change feed ──────────────────────────────────────────────

	/// Subscribe to file-record changes made from now on.
	pub fn subscribe_changes(&self) -> ChangeSubscription {
		ChangeSubscription {
			store: self.clone(),
			rx: self.changes.subscribe(),
			replay: VecDeque::new(),
		}
	}

	/// A synthetic change event for every file that still has `new` transfers.
	/// Used to rebuild pending work after the feed lost events.
	pub async fn pending_file_changes(&self) -> Result<Vec<ChangeEvent>, StoreError> {
		let pending = self.list_transfers_with_status(&[TransferStatus::New]).await?;

		let mut seen = HashSet::new();
		let mut events = Vec::new();
		for transfer in pending {
			if !seen.insert(transfer.file_local_id.clone()) {
				continue;
			}
			match self.get_file(&transfer.file_local_id).await {
				Ok(record) => events.push(ChangeEvent { record, deleted: false }),
				Err(StoreError::NotFound(id)) => {
					debug!(file = %id, transfer = %transfer.id, "transfer points at an uncached file");
				}
				Err(e) => return Err(e),
			}
		}
		Ok(events)
	}
}

/// Lazy, endless sequence of file-record changes.
///
/// If the subscriber falls behind and the feed drops events, the
/// subscription restarts itself by replaying every file that still has
/// pending work, then carries on with live events.
pub struct ChangeSubscription {
	store: LocalStore,
	rx: broadcast::Receiver<ChangeEvent>,
	replay: VecDeque<ChangeEvent>,
}

impl ChangeSubscription {
	pub async fn next(&mut self) -> Option<ChangeEvent> {
		loop {
			if let Some(event) = self.replay.pop_front() {
				return Some(event);
			}

			match self.rx.recv().await {
				Ok(event) => return Some(event),
				Err(broadcast::error::RecvError::Lagged(missed)) => {
					warn!(missed, "change feed lagged; replaying files with pending transfers");
					match self.store.pending_file_changes().await {
						Ok(events) => self.replay.extend(events),
						Err(e) => warn!(error = %e, "failed to rebuild pending changes"),
					}
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

fn from_millis(ms: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
