//! Change detection for one source.
//!
//! Every discovery is compared with the cached record. Unknown or changed
//! files are registered with the control plane, and the transfers it hands
//! back are cached before the file record itself, so by the time the file's
//! change event fires its transfers are already readable.

use std::sync::Arc;

use ferry_core::{
	models::{Discovery, FileRecord, TransferRecord},
	SourceConfig,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
	control_plane::{ControlPlane, RemoteError},
	scanner::{self, ScanError},
	store::{LocalStore, StoreError},
};

const MAX_CONFLICT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum WatchError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error(transparent)]
	Scan(#[from] ScanError),

	#[error("scan task failed: {0}")]
	Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
	/// Cached record matches what is on disk.
	Unchanged,
	/// Registered and cached; `transfers` records were written.
	Registered { transfers: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
	pub files: usize,
	pub registered: usize,
	pub unchanged: usize,
	pub failed: usize,
}

pub struct FileWatcher {
	source: SourceConfig,
	store: LocalStore,
	control: Arc<dyn ControlPlane>,
}

impl FileWatcher {
	pub fn new(source: SourceConfig, store: LocalStore, control: Arc<dyn ControlPlane>) -> Self {
		Self { source, store, control }
	}

	pub fn source(&self) -> &SourceConfig {
		&self.source
	}

	/// Walk the source once and handle every file found. Per-file failures
	/// are logged and counted; only a failed walk is an error.
	pub async fn scan(&self) -> Result<ScanSummary, WatchError> {
		let source = self.source.clone();
		let result = tokio::task::spawn_blocking(move || scanner::scan_source(&source))
			.await
			.map_err(|e| WatchError::Task(e.to_string()))??;

		let mut summary = ScanSummary { files: result.discoveries.len(), ..Default::default() };
		for discovery in &result.discoveries {
			match self.handle_discovery(discovery).await {
				Ok(WatchOutcome::Unchanged) => summary.unchanged += 1,
				Ok(WatchOutcome::Registered { .. }) => summary.registered += 1,
				Err(e) => {
					warn!(source = %self.source.id, path = %discovery.relative_path, error = %e, "failed to process file");
					summary.failed += 1;
				}
			}
		}

		info!(
			source = %self.source.id,
			files = summary.files,
			registered = summary.registered,
			unchanged = summary.unchanged,
			failed = summary.failed,
			"scan finished"
		);
		Ok(summary)
	}

	/// Compare one discovery with the store and register it if it is new or
	/// has changed.
	pub async fn handle_discovery(&self, discovery: &Discovery) -> Result<WatchOutcome, WatchError> {
		let observed = FileRecord::discovered(&self.source.id, &self.source.basepath, discovery);

		let cached = match self.store.get_file(&observed.id).await {
			Ok(cached) => Some(cached),
			Err(StoreError::NotFound(_)) => None,
			Err(e) => return Err(e.into()),
		};

		match &cached {
			Some(cached) if !cached.differs_from(&observed) => {
				debug!(file = %observed.id, "unchanged");
				Ok(WatchOutcome::Unchanged)
			}
			_ => self.register_and_cache(observed, cached).await,
		}
	}

	async fn register_and_cache(&self, observed: FileRecord, cached: Option<FileRecord>) -> Result<WatchOutcome, WatchError> {
		// A remote failure leaves every local record as it was.
		let registration = self.control.register_file(&observed.descriptor(), &self.source.name).await?;

		let records: Vec<TransferRecord> = registration
			.transfers
			.iter()
			.map(|t| TransferRecord::from_descriptor(&observed.id, t))
			.collect();
		let mut transfers = 0;
		for (result, descriptor) in self.store.upsert_transfers(records).await.into_iter().zip(&registration.transfers) {
			match result {
				Ok(_) => transfers += 1,
				Err(e) => warn!(file = %observed.id, transfer = %descriptor.id, error = %e, "failed to cache transfer"),
			}
		}

		let mut record = FileRecord {
			remote_id: registration.remote_id,
			revision: cached.and_then(|c| c.revision),
			..observed
		};

		let mut attempt = 1;
		loop {
			match self.store.upsert_file(record.clone()).await {
				Ok(stored) => {
					info!(
						file = %stored.id,
						remote_id = %stored.remote_id,
						size = stored.size,
						revision = stored.revision,
						transfers,
						"file registered"
					);
					return Ok(WatchOutcome::Registered { transfers });
				}
				Err(StoreError::Conflict { found, .. }) if attempt < MAX_CONFLICT_ATTEMPTS => {
					debug!(file = %record.id, attempt, "revision conflict; retrying with stored revision");
					record.revision = found;
					attempt += 1;
				}
				Err(e) => return Err(e.into()),
			}
		}
	}
}
