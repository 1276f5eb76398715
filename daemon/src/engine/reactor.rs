//! Turns file-record changes into queued transfer jobs.
//!
//! The reactor is the only thing that enqueues. It runs as a single task, so
//! live change events and sweeps never race each other, and the queue's
//! per-transfer hold keeps a record from being enqueued twice while it is
//! still waiting or running.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use ferry_core::{
	models::{FileRecord, TransferJob, TransferRecord, TransferStatus},
	AgentConfig,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
	queue::{QueueError, TransferQueuePool},
	reconcile::{self, RetryPolicy},
};
use crate::{
	control_plane::ControlPlane,
	store::{ChangeEvent, LocalStore, StoreError},
};

/// What happened to the `new` transfers considered in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSummary {
	pub queued: usize,
	/// Already waiting or running in its queue.
	pub already_queued: usize,
	/// Left `new`: saturated queue, busy file, bad reference, store error.
	pub deferred: usize,
}

impl SubmitSummary {
	fn add(&mut self, other: SubmitSummary) {
		self.queued += other.queued;
		self.already_queued += other.already_queued;
		self.deferred += other.deferred;
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
	/// Failed or interrupted transfers handed back to `new`.
	pub retried: usize,
	pub submitted: SubmitSummary,
}

enum Submission {
	Queued,
	AlreadyQueued,
	Deferred,
}

pub struct ChangeReactor {
	config: Arc<AgentConfig>,
	store: LocalStore,
	pool: Arc<TransferQueuePool>,
	control: Arc<dyn ControlPlane>,
	retry: RetryPolicy,
}

impl ChangeReactor {
	pub fn new(
		config: Arc<AgentConfig>,
		store: LocalStore,
		pool: Arc<TransferQueuePool>,
		control: Arc<dyn ControlPlane>,
	) -> Self {
		let retry = RetryPolicy::from(&config.retry);
		Self { config, store, pool, control, retry }
	}

	/// Subscribe, sweep once, then follow the change feed with a sweep every
	/// `sweep_interval`. Returns when `shutdown` flips or its sender is gone.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		// Subscribe before the startup sweep so nothing written meanwhile is missed.
		let mut changes = self.store.subscribe_changes();
		if let Err(e) = self.reconcile().await {
			warn!(error = %e, "startup sweep failed");
		}

		let period = self.config.sweep_interval();
		let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

		info!(sweep_secs = period.as_secs(), "change reactor started");
		loop {
			tokio::select! {
				biased;
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}
				_ = sweep.tick() => {
					if let Err(e) = self.reconcile().await {
						warn!(error = %e, "reconciliation sweep failed");
					}
				}
				change = changes.next() => match change {
					Some(event) => {
						self.handle_change(event).await;
					}
					None => break,
				},
			}
		}
		info!("change reactor stopped");
	}

	/// Queue every `new` transfer of the changed file.
	pub async fn handle_change(&self, event: ChangeEvent) -> SubmitSummary {
		if event.deleted {
			debug!(file = %event.record.id, "ignoring removed file");
			return SubmitSummary::default();
		}

		let transfers = match self.store.list_transfers_for_file(&event.record.id).await {
			Ok(transfers) => transfers,
			Err(e) => {
				warn!(file = %event.record.id, error = %e, "failed to load transfers");
				return SubmitSummary::default();
			}
		};

		let mut summary = SubmitSummary::default();
		for transfer in transfers.iter().filter(|t| t.status == TransferStatus::New) {
			summary.add(self.submit(&event.record, transfer).await.into());
		}
		summary
	}

	/// Retry what is due, then queue every `new` transfer in the store,
	/// oldest first. Covers events the live feed never delivered, such as
	/// work left over from a previous process.
	pub async fn reconcile(&self) -> Result<SweepSummary, StoreError> {
		let retried = reconcile::reset_retryable(&self.store, &self.retry, Utc::now()).await?;
		let pending = self.store.list_transfers_with_status(&[TransferStatus::New]).await?;

		let mut files: HashMap<String, Option<FileRecord>> = HashMap::new();
		let mut submitted = SubmitSummary::default();
		for transfer in &pending {
			if !files.contains_key(&transfer.file_local_id) {
				let file = match self.store.get_file(&transfer.file_local_id).await {
					Ok(file) => Some(file),
					Err(StoreError::NotFound(_)) => None,
					Err(e) => return Err(e),
				};
				files.insert(transfer.file_local_id.clone(), file);
			}

			match files.get(&transfer.file_local_id) {
				Some(Some(file)) => submitted.add(self.submit(file, transfer).await.into()),
				_ => {
					// Transfers are cached before their file; the file write may still be coming.
					debug!(transfer = %transfer.id, file = %transfer.file_local_id, "pending transfer has no cached file yet");
					submitted.deferred += 1;
				}
			}
		}

		let summary = SweepSummary { retried, submitted };
		if summary != SweepSummary::default() {
			info!(
				retried,
				queued = submitted.queued,
				already_queued = submitted.already_queued,
				deferred = submitted.deferred,
				"reconciliation sweep"
			);
		}
		Ok(summary)
	}

	/// Reserve a slot, mark the record queued, tell the control plane, then
	/// make the job dispatchable. Any refusal leaves the record `new`.
	async fn submit(&self, file: &FileRecord, transfer: &TransferRecord) -> Submission {
		let Some(source) = self.config.source(&file.source_id) else {
			warn!(transfer = %transfer.id, source = %file.source_id, "file belongs to an unknown source");
			return Submission::Deferred;
		};
		let queue = match self.pool.queue(&transfer.destination_id) {
			Ok(queue) => queue,
			Err(e) => {
				warn!(transfer = %transfer.id, error = %e, "cannot queue transfer");
				return Submission::Deferred;
			}
		};

		let reservation = match queue.reserve(TransferJob::build(file, transfer, source)) {
			Ok(reservation) => reservation,
			Err(QueueError::AlreadyQueued(_)) => return Submission::AlreadyQueued,
			Err(e) => {
				debug!(transfer = %transfer.id, error = %e, "transfer left new");
				return Submission::Deferred;
			}
		};

		match self.store.advance_transfer(&transfer.id, TransferStatus::Queued, 0).await {
			Ok(Some(_)) => {}
			Ok(None) => {
				debug!(transfer = %transfer.id, "transfer moved on before it could be queued");
				return Submission::Deferred;
			}
			Err(e) => {
				warn!(transfer = %transfer.id, error = %e, "failed to mark transfer queued");
				return Submission::Deferred;
			}
		}

		if let Err(e) = self
			.control
			.report_transfer_progress(&transfer.id, transfer.bytes_transferred, TransferStatus::Queued)
			.await
		{
			warn!(transfer = %transfer.id, error = %e, "control plane did not take queued report");
		}

		reservation.commit();
		debug!(transfer = %transfer.id, destination = %transfer.destination_id, "transfer queued");
		Submission::Queued
	}
}

impl From<Submission> for SubmitSummary {
	fn from(submission: Submission) -> Self {
		let mut summary = SubmitSummary::default();
		match submission {
			Submission::Queued => summary.queued = 1,
			Submission::AlreadyQueued => summary.already_queued = 1,
			Submission::Deferred => summary.deferred = 1,
		}
		summary
	}
}
