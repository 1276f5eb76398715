use serde::{Deserialize, Serialize};

use crate::identity;

/// What the agent remembers about one file in a watched source.
/// The basis for change detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
	pub id: String,
	/// Assigned by the control plane; empty until the first registration.
	pub remote_id: String,
	pub source_id: String,
	pub relative_path: String,
	pub size: u64,
	/// Unix milliseconds.
	pub mod_time: i64,
	pub content_hash: String,
	/// Store revision, `None` until the record has been written once.
	pub revision: Option<u64>,
}

impl FileRecord {
	/// Build a fresh, never-stored record from a discovery.
	pub fn discovered(source_id: &str, base_path: &std::path::Path, discovery: &Discovery) -> Self {
		let id = identity::file_id(base_path, &discovery.relative_path);
		let content_hash = identity::content_hash(&id, discovery.size, discovery.mod_time);
		Self {
			id,
			remote_id: String::new(),
			source_id: source_id.to_string(),
			relative_path: discovery.relative_path.clone(),
			size: discovery.size,
			mod_time: discovery.mod_time,
			content_hash,
			revision: None,
		}
	}

	/// Whether the on-disk observation differs from this cached version.
	pub fn differs_from(&self, observed: &FileRecord) -> bool {
		self.size != observed.size || self.mod_time != observed.mod_time || self.content_hash != observed.content_hash
	}

	/// Descriptor sent to the control plane when registering this file.
	pub fn descriptor(&self) -> FileDescriptor {
		FileDescriptor {
			local_id: self.id.clone(),
			relative_path: self.relative_path.clone(),
			size: self.size,
			mod_time: self.mod_time,
			content_hash: self.content_hash.clone(),
		}
	}
}

/// One entry of the discovery feed for a source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discovery {
	pub relative_path: String,
	pub size: u64,
	pub mod_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDescriptor {
	pub local_id: String,
	pub relative_path: String,
	pub size: u64,
	pub mod_time: i64,
	pub content_hash: String,
}
