use std::{
	fs,
	io::{self, Read, Write},
	path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, warn};

use super::{EventSink, TransferMethod, TransferRequest};

const CHUNK_SIZE: usize = 256 * 1024; // 256KB
const PROGRESS_INTERVAL: usize = 4; // report every 4 chunks (~1MB)

#[derive(Debug, Error)]
pub enum CopyError {
	#[error("source file not found: {0}")]
	SourceNotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("disk full: {0}")]
	DiskFull(String),

	#[error("I/O error: {0}")]
	IoError(String),

	#[error("copy cancelled after {0} bytes")]
	Cancelled(u64),

	#[error("hash mismatch: source={source_hash}, dest={dest_hash}")]
	HashMismatch {
		source_hash: String,
		dest_hash: String,
	},
}

#[derive(Debug, Clone)]
pub struct CopyResult {
	pub bytes_copied: u64,
	pub dest_hash: String,
}

/// Copies files under the destination's base path, keeping the source's
/// relative layout, and verifies the copy with blake3.
#[derive(Debug, Clone)]
pub struct LocalCopy {
	dest_base: PathBuf,
}

impl LocalCopy {
	pub const NAME: &'static str = "local";

	pub fn new(dest_base: PathBuf) -> Self {
		Self { dest_base }
	}
}

impl TransferMethod for LocalCopy {
	fn name(&self) -> &str {
		Self::NAME
	}

	fn transfer(&self, request: TransferRequest, events: EventSink) {
		let dest = self.dest_base.join(&request.relative_path);

		tokio::spawn(async move {
			events.start(0);

			// Blocking I/O on a dedicated thread; the sink travels with it.
			let source = request.file_path.clone();
			let outcome = tokio::task::spawn_blocking(move || {
				let result = copy_and_hash(&source, &dest, &events);
				(result, events)
			})
			.await;

			match outcome {
				Ok((Ok(copy), events)) => {
					debug!(transfer = %request.transfer_id, bytes = copy.bytes_copied, hash = %copy.dest_hash, "copy verified");
					events.complete(copy.bytes_copied);
				}
				Ok((Err(err), events)) => events.fail(err.to_string()),
				// The sink was dropped with the task; the manager sees a failure.
				Err(e) => warn!(transfer = %request.transfer_id, error = %e, "copy task panicked"),
			}
		});
	}
}

/// Core copy pipeline: read source → hash → write dest → verify.
/// This is synchronous and should run on spawn_blocking.
fn copy_and_hash(source_path: &Path, dest_path: &Path, events: &EventSink) -> Result<CopyResult, CopyError> {
	// Create destination parent directories
	if let Some(parent) = dest_path.parent() {
		fs::create_dir_all(parent).map_err(|e| map_io_error(e, parent))?;
	}

	let mut source = fs::File::open(source_path).map_err(|e| map_io_error(e, source_path))?;
	let mut dest = fs::File::create(dest_path).map_err(|e| map_io_error(e, dest_path))?;

	// Single-pass: read → hash → write
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];
	let mut bytes_copied: u64 = 0;
	let mut chunks_since_progress = 0usize;

	loop {
		let n = source.read(&mut buf).map_err(|e| map_io_error(e, source_path))?;
		if n == 0 {
			break;
		}
		if events.is_cancelled() {
			return Err(CopyError::Cancelled(bytes_copied));
		}

		hasher.update(&buf[..n]);
		dest.write_all(&buf[..n]).map_err(|e| map_io_error(e, dest_path))?;

		bytes_copied += n as u64;
		chunks_since_progress += 1;

		if chunks_since_progress >= PROGRESS_INTERVAL {
			chunks_since_progress = 0;
			events.progress(bytes_copied);
		}
	}

	dest.flush().map_err(|e| map_io_error(e, dest_path))?;
	drop(dest);

	let source_hash = hasher.finalize().to_hex().to_string();

	// Verify: re-read dest, compute hash
	events.verifying(bytes_copied);
	let dest_hash = hash_file(dest_path)?;

	if source_hash != dest_hash {
		return Err(CopyError::HashMismatch { source_hash, dest_hash });
	}

	Ok(CopyResult { bytes_copied, dest_hash })
}

/// Hash a file using blake3 in 256KB chunks.
pub fn hash_file(path: &Path) -> Result<String, CopyError> {
	let mut file = fs::File::open(path).map_err(|e| map_io_error(e, path))?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];

	loop {
		let n = file.read(&mut buf).map_err(|e| map_io_error(e, path))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}

	Ok(hasher.finalize().to_hex().to_string())
}

fn map_io_error(err: io::Error, path: &Path) -> CopyError {
	let path = path.display().to_string();
	match err.kind() {
		io::ErrorKind::NotFound => CopyError::SourceNotFound(path),
		io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(path),
		io::ErrorKind::StorageFull => CopyError::DiskFull(path),
		_ => CopyError::IoError(format!("{path}: {err}")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::methods::MethodEvent;

	async fn run(method: &LocalCopy, request: TransferRequest) -> Vec<MethodEvent> {
		let (sink, mut rx) = EventSink::channel();
		method.transfer(request, sink);
		let mut events = Vec::new();
		while let Some(event) = rx.recv().await {
			events.push(event);
		}
		events
	}

	#[tokio::test]
	async fn copies_into_destination_layout() {
		let tmp = tempfile::tempdir().unwrap();
		let src = tmp.path().join("source/run1/a.txt");
		fs::create_dir_all(src.parent().unwrap()).unwrap();
		fs::write(&src, "hello world").unwrap();

		let dest_base = tmp.path().join("dest");
		let method = LocalCopy::new(dest_base.clone());
		let events = run(
			&method,
			TransferRequest {
				transfer_id: "t1".into(),
				file_path: src.clone(),
				relative_path: "run1/a.txt".into(),
				size: 11,
			},
		)
		.await;

		assert_eq!(events.first(), Some(&MethodEvent::Started { bytes: 0 }));
		assert!(events.contains(&MethodEvent::Verifying { bytes: 11 }));
		assert_eq!(events.last(), Some(&MethodEvent::Completed { bytes: 11 }));
		assert_eq!(fs::read_to_string(dest_base.join("run1/a.txt")).unwrap(), "hello world");
	}

	#[tokio::test]
	async fn missing_source_fails() {
		let tmp = tempfile::tempdir().unwrap();
		let method = LocalCopy::new(tmp.path().join("dest"));
		let events = run(
			&method,
			TransferRequest {
				transfer_id: "t1".into(),
				file_path: tmp.path().join("nope.txt"),
				relative_path: "nope.txt".into(),
				size: 0,
			},
		)
		.await;

		assert!(matches!(events.last(), Some(MethodEvent::Failed { reason }) if reason.contains("source file not found")));
		assert!(!events.iter().any(|e| matches!(e, MethodEvent::Completed { .. })));
	}

	#[tokio::test]
	async fn reports_progress_for_large_files() {
		let tmp = tempfile::tempdir().unwrap();
		let src = tmp.path().join("big.bin");
		let data = vec![7u8; CHUNK_SIZE * PROGRESS_INTERVAL * 2];
		fs::write(&src, &data).unwrap();

		let method = LocalCopy::new(tmp.path().join("dest"));
		let events = run(
			&method,
			TransferRequest {
				transfer_id: "t1".into(),
				file_path: src,
				relative_path: "big.bin".into(),
				size: data.len() as u64,
			},
		)
		.await;

		let progress: Vec<u64> = events
			.iter()
			.filter_map(|e| match e {
				MethodEvent::Progress { bytes } => Some(*bytes),
				_ => None,
			})
			.collect();
		assert_eq!(progress.len(), 2);
		assert!(progress.windows(2).all(|w| w[0] <= w[1]));
	}

	#[test]
	fn cancelled_copy_stops_before_writing() {
		let tmp = tempfile::tempdir().unwrap();
		let src = tmp.path().join("a.bin");
		fs::write(&src, vec![1u8; CHUNK_SIZE * 2]).unwrap();
		let dest = tmp.path().join("dest/a.bin");

		let (sink, stream) = EventSink::channel();
		drop(stream);

		let err = copy_and_hash(&src, &dest, &sink).unwrap_err();
		assert!(matches!(err, CopyError::Cancelled(0)));
		assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
	}

	#[test]
	fn hash_empty_file() {
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("empty.txt");
		fs::write(&f, "").unwrap();

		let hash = hash_file(&f).unwrap();
		assert_eq!(hash.len(), 64); // blake3 hex
	}

	#[test]
	fn hash_multichunk_file() {
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("big.bin");
		let data = vec![42u8; CHUNK_SIZE * 3 + 1000];
		fs::write(&f, &data).unwrap();

		// Must match blake3 computed in one shot
		let expected = blake3::hash(&data).to_hex().to_string();
		assert_eq!(hash_file(&f).unwrap(), expected);
	}

	#[test]
	fn hash_file_not_found() {
		let err = hash_file(Path::new("/tmp/ferry_definitely_not_real.txt")).unwrap_err();
		assert!(matches!(err, CopyError::SourceNotFound(_)));
	}
}
