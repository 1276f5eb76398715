use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file's delivery lineage to one destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
	pub id: String,
	/// Lookup-only reference to `FileRecord::id`.
	pub file_local_id: String,
	pub destination_id: String,
	pub status: TransferStatus,
	pub bytes_transferred: u64,
	/// Retries granted so far by the reconciliation sweep.
	pub attempts: u32,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
	pub fn new(id: impl Into<String>, file_local_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
		let now = Utc::now();
		Self {
			id: id.into(),
			file_local_id: file_local_id.into(),
			destination_id: destination_id.into(),
			status: TransferStatus::New,
			bytes_transferred: 0,
			attempts: 0,
			created_at: now,
			updated_at: now,
		}
	}

	/// Local record for a transfer the control plane told us about.
	pub fn from_descriptor(file_local_id: &str, descriptor: &TransferDescriptor) -> Self {
		let mut record = Self::new(descriptor.id.clone(), file_local_id, descriptor.destination_id.clone());
		record.status = descriptor.status;
		record.bytes_transferred = descriptor.bytes_transferred;
		record
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
	New,
	Queued,
	Uploading,
	Verifying,
	Complete,
	Failed,
	Interrupted,
}

impl TransferStatus {
	pub const ALL: [TransferStatus; 7] = [
		TransferStatus::New,
		TransferStatus::Queued,
		TransferStatus::Uploading,
		TransferStatus::Verifying,
		TransferStatus::Complete,
		TransferStatus::Failed,
		TransferStatus::Interrupted,
	];

	/// Statuses that hold a queue slot or backlog entry.
	pub const IN_FLIGHT: [TransferStatus; 3] =
		[TransferStatus::Queued, TransferStatus::Uploading, TransferStatus::Verifying];

	pub fn as_str(self) -> &'static str {
		match self {
			TransferStatus::New => "new",
			TransferStatus::Queued => "queued",
			TransferStatus::Uploading => "uploading",
			TransferStatus::Verifying => "verifying",
			TransferStatus::Complete => "complete",
			TransferStatus::Failed => "failed",
			TransferStatus::Interrupted => "interrupted",
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, TransferStatus::Complete | TransferStatus::Failed | TransferStatus::Interrupted)
	}

	/// Whether a failed or interrupted transfer may be handed back to `new`.
	pub fn is_retryable(self) -> bool {
		matches!(self, TransferStatus::Failed | TransferStatus::Interrupted)
	}

	fn rank(self) -> u8 {
		match self {
			TransferStatus::New => 0,
			TransferStatus::Queued => 1,
			TransferStatus::Uploading => 2,
			TransferStatus::Verifying => 3,
			TransferStatus::Complete | TransferStatus::Failed | TransferStatus::Interrupted => 4,
		}
	}

	/// Forward-only lifecycle. Re-entering the same non-terminal status is allowed
	/// (progress updates); nothing leaves a terminal status here.
	pub fn can_advance_to(self, next: TransferStatus) -> bool {
		!self.is_terminal() && next.rank() >= self.rank()
	}
}

impl fmt::Display for TransferStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transfer status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TransferStatus {
	type Err = UnknownStatus;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TransferStatus::ALL
			.into_iter()
			.find(|status| status.as_str() == s)
			.ok_or_else(|| UnknownStatus(s.to_string()))
	}
}

/// A transfer as described by the control plane in a registration response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferDescriptor {
	pub id: String,
	pub destination_id: String,
	pub status: TransferStatus,
	#[serde(default)]
	pub bytes_transferred: u64,
}

/// Control-plane answer to a file registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
	pub remote_id: String,
	pub transfers: Vec<TransferDescriptor>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_parses_its_own_name() {
		for status in TransferStatus::ALL {
			assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
		}
		assert!("done".parse::<TransferStatus>().is_err());
	}

	#[test]
	fn lifecycle_only_moves_forward() {
		use TransferStatus::*;
		assert!(New.can_advance_to(Queued));
		assert!(New.can_advance_to(Uploading));
		assert!(Queued.can_advance_to(Uploading));
		assert!(Uploading.can_advance_to(Uploading));
		assert!(Uploading.can_advance_to(Verifying));
		assert!(Verifying.can_advance_to(Complete));
		assert!(Uploading.can_advance_to(Failed));

		assert!(!Uploading.can_advance_to(Queued));
		assert!(!Complete.can_advance_to(Uploading));
		assert!(!Failed.can_advance_to(New));
		assert!(!Interrupted.can_advance_to(Queued));
	}

	#[test]
	fn serde_uses_snake_case() {
		let json = serde_json::to_string(&TransferStatus::Interrupted).unwrap();
		assert_eq!(json, "\"interrupted\"");
	}
}
