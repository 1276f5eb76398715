//! Boundary to the remote service of record.
//!
//! The agent only needs two calls: register a file version and learn which
//! transfers the service wants for it, and acknowledge transfer progress.
//! Neither call is retried here; callers decide what a failure means.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ferry_core::{
	models::{FileDescriptor, Registration, TransferDescriptor, TransferStatus},
	AgentConfig,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
	#[error("control plane unavailable: {0}")]
	Unavailable(String),

	#[error("control plane rejected the request: {0}")]
	Rejected(String),
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
	/// Register (or re-register) a file version. `source_name` is the
	/// human-readable name of the source the file was found in.
	async fn register_file(&self, descriptor: &FileDescriptor, source_name: &str) -> Result<Registration, RemoteError>;

	async fn report_transfer_progress(
		&self,
		transfer_id: &str,
		bytes_transferred: u64,
		status: TransferStatus,
	) -> Result<(), RemoteError>;
}

struct Registered {
	remote_id: String,
	content_hash: String,
	transfers: Vec<TransferDescriptor>,
}

/// Control plane that lives inside the agent process.
///
/// Every file gets a stable remote id and one transfer per destination of
/// its source. Registering the same version again returns the transfers
/// already issued. A changed content hash keeps each transfer that has not
/// started yet, since it will pick up the new content anyway, and issues a
/// fresh one where the old one is already under way or done.
pub struct StandaloneControlPlane {
	config: Arc<AgentConfig>,
	files: Mutex<HashMap<String, Registered>>,
	/// transfer id -> last reported status.
	progress: Mutex<HashMap<String, TransferStatus>>,
}

impl StandaloneControlPlane {
	pub fn new(config: Arc<AgentConfig>) -> Self {
		Self {
			config,
			files: Mutex::new(HashMap::new()),
			progress: Mutex::new(HashMap::new()),
		}
	}

	fn not_started(&self, transfer_id: &str) -> bool {
		matches!(
			self.progress.lock().get(transfer_id),
			None | Some(TransferStatus::New) | Some(TransferStatus::Queued)
		)
	}

	fn destinations_for(&self, source_name: &str) -> Result<Vec<String>, RemoteError> {
		self.config
			.sources
			.iter()
			.find(|s| s.name == source_name || s.id == source_name)
			.map(|s| s.destinations.clone())
			.ok_or_else(|| RemoteError::Rejected(format!("unknown source: {source_name}")))
	}
}

#[async_trait]
impl ControlPlane for StandaloneControlPlane {
	async fn register_file(&self, descriptor: &FileDescriptor, source_name: &str) -> Result<Registration, RemoteError> {
		let destinations = self.destinations_for(source_name)?;
		let mut files = self.files.lock();

		if let Some(known) = files.get(&descriptor.local_id) {
			if known.content_hash == descriptor.content_hash {
				return Ok(Registration { remote_id: known.remote_id.clone(), transfers: known.transfers.clone() });
			}
		}

		let previous = files.get(&descriptor.local_id);
		let remote_id = previous
			.map(|known| known.remote_id.clone())
			.unwrap_or_else(|| Ulid::new().to_string());
		let transfers: Vec<TransferDescriptor> = destinations
			.into_iter()
			.map(|destination_id| {
				let pending = previous
					.and_then(|known| known.transfers.iter().find(|t| t.destination_id == destination_id))
					.filter(|t| self.not_started(&t.id));
				match pending {
					Some(pending) => pending.clone(),
					None => TransferDescriptor {
						id: Ulid::new().to_string(),
						destination_id,
						status: TransferStatus::New,
						bytes_transferred: 0,
					},
				}
			})
			.collect();

		info!(file = %descriptor.local_id, remote_id = %remote_id, transfers = transfers.len(), "registered file");
		files.insert(
			descriptor.local_id.clone(),
			Registered {
				remote_id: remote_id.clone(),
				content_hash: descriptor.content_hash.clone(),
				transfers: transfers.clone(),
			},
		);
		Ok(Registration { remote_id, transfers })
	}

	async fn report_transfer_progress(
		&self,
		transfer_id: &str,
		bytes_transferred: u64,
		status: TransferStatus,
	) -> Result<(), RemoteError> {
		debug!(transfer = transfer_id, bytes = bytes_transferred, %status, "transfer progress");
		self.progress.lock().insert(transfer_id.to_string(), status);
		Ok(())
	}
}
