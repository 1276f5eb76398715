//! Per-destination dispatch loop.
//!
//! A manager owns nothing but its resolved transfer method: it pulls jobs from
//! its destination's queue, hands each to the method, and follows the job's
//! event stream in a task of its own so progress for one transfer is applied
//! strictly in emission order.

use std::{sync::Arc, time::Duration};

use ferry_core::{
	models::{TransferJob, TransferStatus},
	AgentConfig,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::queue::{JobOutcome, QueueError, QueueEvent, TransferQueue, TransferQueuePool};
use crate::{
	control_plane::ControlPlane,
	methods::{
		EventSink, EventStream, MethodError, MethodEvent, MethodOptions, MethodRegistry, TransferMethod, TransferRequest,
	},
	store::LocalStore,
};

#[derive(Debug, Error)]
pub enum ManagerError {
	#[error("unknown destination: {0}")]
	UnknownDestination(String),

	#[error("destination {destination} references unknown host {host}")]
	UnknownHost { destination: String, host: String },

	#[error(transparent)]
	Method(#[from] MethodError),

	#[error(transparent)]
	Queue(#[from] QueueError),
}

pub struct TransferManager {
	destination_id: String,
	queue: Arc<TransferQueue>,
	store: LocalStore,
	control: Arc<dyn ControlPlane>,
	method: Box<dyn TransferMethod>,
	job_timeout: Option<Duration>,
}

impl TransferManager {
	/// Resolve the destination's host and build its transfer method. This is
	/// the only place a method is looked up.
	pub fn new(
		destination_id: &str,
		config: &AgentConfig,
		pool: &TransferQueuePool,
		store: LocalStore,
		control: Arc<dyn ControlPlane>,
		registry: &MethodRegistry,
	) -> Result<Self, ManagerError> {
		let destination = config
			.destination(destination_id)
			.ok_or_else(|| ManagerError::UnknownDestination(destination_id.to_string()))?;
		let host = config.host(&destination.host_id).ok_or_else(|| ManagerError::UnknownHost {
			destination: destination_id.to_string(),
			host: destination.host_id.clone(),
		})?;

		let method = registry.build(&host.transfer_method, MethodOptions::for_destination(host, destination))?;
		let queue = pool.queue(destination_id)?;
		debug!(destination = destination_id, method = method.name(), "transfer manager ready");

		Ok(Self {
			destination_id: destination_id.to_string(),
			queue,
			store,
			control,
			method,
			job_timeout: config.job_timeout(),
		})
	}

	pub fn destination_id(&self) -> &str {
		&self.destination_id
	}

	pub fn queue(&self) -> &Arc<TransferQueue> {
		&self.queue
	}

	/// Lifecycle events of this manager's queue.
	pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
		self.queue.subscribe()
	}

	/// Stop dispatching new jobs. Running jobs carry on.
	pub fn pause(&self) {
		info!(destination = %self.destination_id, "pausing transfers");
		self.queue.pause();
	}

	pub fn resume(&self) {
		info!(destination = %self.destination_id, "resuming transfers");
		self.queue.resume();
	}

	/// Pull loop. Ends when `shutdown` flips (or its sender goes away) or the
	/// queue is closed.
	pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		info!(destination = %self.destination_id, method = self.method.name(), "transfer manager started");

		if !*shutdown.borrow() {
			loop {
				let job = tokio::select! {
					biased;
					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							break;
						}
						continue;
					}
					job = self.queue.dequeue() => job,
				};

				let Some(job) = job else { break };
				self.dispatch(job);
			}
		}

		info!(destination = %self.destination_id, "transfer manager stopped");
	}

	/// Start one job. Returns as soon as the method has been handed the job.
	fn dispatch(self: &Arc<Self>, job: TransferJob) {
		let (sink, events) = EventSink::channel();
		let request = TransferRequest {
			transfer_id: job.transfer_id.clone(),
			file_path: job.file_path.clone(),
			relative_path: job.relative_path.clone(),
			size: job.size,
		};

		info!(
			destination = %self.destination_id,
			transfer = %job.transfer_id,
			path = %job.file_path.display(),
			size = job.size,
			"starting transfer"
		);
		self.method.transfer(request, sink);

		let manager = Arc::clone(self);
		tokio::spawn(async move { manager.follow(job, events).await });
	}

	async fn follow(&self, job: TransferJob, mut events: EventStream) {
		let outcome = loop {
			let next = match self.job_timeout {
				Some(limit) => match tokio::time::timeout(limit, events.recv()).await {
					Ok(event) => event,
					Err(_) => {
						break JobOutcome::Interrupted {
							reason: format!("no word from transfer method for {}s", limit.as_secs()),
						}
					}
				},
				None => events.recv().await,
			};

			match next {
				Some(MethodEvent::Started { bytes }) | Some(MethodEvent::Progress { bytes }) => {
					self.record(&job, TransferStatus::Uploading, bytes).await
				}
				Some(MethodEvent::Verifying { bytes }) => self.record(&job, TransferStatus::Verifying, bytes).await,
				Some(MethodEvent::Completed { bytes }) => break JobOutcome::Complete { bytes_transferred: bytes },
				Some(MethodEvent::Failed { reason }) => break JobOutcome::Failed { reason },
				None => {
					break JobOutcome::Failed {
						reason: "transfer method stopped without reporting an outcome".into(),
					}
				}
			}
		};

		self.settle(&job, &outcome).await;

		match outcome {
			// The method may still be writing. Keep the transfer and its file
			// held until it lets go, so a retry cannot run alongside it.
			JobOutcome::Interrupted { reason } => {
				self.queue.detach(&job, reason);
				events.abandon().await;
				debug!(transfer = %job.transfer_id, "transfer method released interrupted job");
				self.queue.reclaim(&job);
			}
			outcome => self.queue.finish(&job, outcome),
		}
	}

	/// Apply a non-terminal event: store first, then tell the control plane.
	async fn record(&self, job: &TransferJob, status: TransferStatus, bytes: u64) {
		match self.store.advance_transfer(&job.transfer_id, status, bytes).await {
			Ok(Some(record)) => self.report(&record.id, record.bytes_transferred, record.status).await,
			Ok(None) => debug!(transfer = %job.transfer_id, %status, "stale progress ignored"),
			Err(e) => warn!(transfer = %job.transfer_id, %status, error = %e, "failed to record progress"),
		}
	}

	/// Write the terminal status and report it.
	async fn settle(&self, job: &TransferJob, outcome: &JobOutcome) {
		let (status, bytes) = match outcome {
			JobOutcome::Complete { bytes_transferred } => (TransferStatus::Complete, *bytes_transferred),
			JobOutcome::Failed { .. } => (TransferStatus::Failed, 0),
			JobOutcome::Interrupted { .. } => (TransferStatus::Interrupted, 0),
		};

		match outcome {
			JobOutcome::Complete { bytes_transferred } => {
				info!(destination = %self.destination_id, transfer = %job.transfer_id, bytes = bytes_transferred, "transfer complete")
			}
			JobOutcome::Failed { reason } => {
				error!(destination = %self.destination_id, transfer = %job.transfer_id, %reason, "transfer failed")
			}
			JobOutcome::Interrupted { reason } => {
				warn!(destination = %self.destination_id, transfer = %job.transfer_id, %reason, "transfer interrupted")
			}
		}

		match self.store.advance_transfer(&job.transfer_id, status, bytes).await {
			Ok(Some(record)) => self.report(&record.id, record.bytes_transferred, record.status).await,
			Ok(None) => warn!(transfer = %job.transfer_id, %status, "transfer already settled"),
			Err(e) => error!(transfer = %job.transfer_id, %status, error = %e, "failed to record outcome"),
		}
	}

	async fn report(&self, transfer_id: &str, bytes: u64, status: TransferStatus) {
		if let Err(e) = self.control.report_transfer_progress(transfer_id, bytes, status).await {
			warn!(transfer = transfer_id, %status, error = %e, "control plane did not take progress report");
		}
	}
}
