use std::path::PathBuf;

use crate::{
	config::SourceConfig,
	models::{FileRecord, TransferRecord},
};

/// A concrete unit of work: one file, one destination.
/// Lives only inside a queue and then its manager; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
	pub transfer_id: String,
	pub destination_id: String,
	pub file_local_id: String,
	pub source_id: String,
	pub file_path: PathBuf,
	pub relative_path: String,
	pub size: u64,
}

impl TransferJob {
	pub fn build(file: &FileRecord, transfer: &TransferRecord, source: &SourceConfig) -> Self {
		Self {
			transfer_id: transfer.id.clone(),
			destination_id: transfer.destination_id.clone(),
			file_local_id: file.id.clone(),
			source_id: file.source_id.clone(),
			file_path: source.basepath.join(&file.relative_path),
			relative_path: file.relative_path.clone(),
			size: file.size,
		}
	}
}
