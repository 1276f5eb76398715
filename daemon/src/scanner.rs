use std::{path::Path, time::SystemTime};

use chrono::{DateTime, Utc};
use ferry_core::{models::Discovery, SourceConfig};
use glob::Pattern;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("source path does not exist: {0}")]
	SourcePathNotExists(String),

	#[error("source path is not a directory: {0}")]
	SourcePathNotDir(String),

	#[error("invalid exclude pattern {pattern:?}: {reason}")]
	BadPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
	pub discoveries: Vec<Discovery>,
	pub total_bytes: u64,
	pub excluded_entries: u64,
	pub skipped_entries: u64,
}

/// Walk a source tree and report every regular file not matched by an
/// exclude pattern. Blocking; run on spawn_blocking.
pub fn scan_source(source: &SourceConfig) -> Result<ScanResult, ScanError> {
	let excludes = compile_excludes(&source.exclude)?;
	walk_source(&source.basepath, &excludes)
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<Pattern>, ScanError> {
	patterns
		.iter()
		.map(|p| {
			Pattern::new(p).map_err(|e| ScanError::BadPattern { pattern: p.clone(), reason: e.to_string() })
		})
		.collect()
}

fn is_excluded(excludes: &[Pattern], relative: &str, name: &str) -> bool {
	excludes.iter().any(|p| p.matches(relative) || p.matches(name))
}

fn walk_source(root: &Path, excludes: &[Pattern]) -> Result<ScanResult, ScanError> {
	if !root.exists() {
		return Err(ScanError::SourcePathNotExists(root.display().to_string()));
	}
	if !root.is_dir() {
		return Err(ScanError::SourcePathNotDir(root.display().to_string()));
	}

	let mut result = ScanResult::default();
	let mut walker = WalkDir::new(root).follow_links(false).into_iter();

	while let Some(next) = walker.next() {
		let entry = match next {
			Ok(e) => e,
			Err(_) => {
				result.skipped_entries += 1;
				continue;
			}
		};
		if entry.depth() == 0 {
			continue;
		}

		let Ok(relative) = entry.path().strip_prefix(root) else {
			result.skipped_entries += 1;
			continue;
		};
		let relative = relative.to_string_lossy().to_string();
		let name = entry.file_name().to_string_lossy();

		if is_excluded(excludes, &relative, &name) {
			result.excluded_entries += 1;
			if entry.file_type().is_dir() {
				walker.skip_current_dir();
			}
			continue;
		}

		if entry.file_type().is_dir() {
			continue;
		}
		if entry.file_type().is_symlink() {
			result.skipped_entries += 1;
			continue;
		}

		let metadata = match entry.metadata() {
			Ok(m) => m,
			Err(_) => {
				result.skipped_entries += 1;
				continue;
			}
		};

		let modified: DateTime<Utc> = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
		result.total_bytes += metadata.len();
		result.discoveries.push(Discovery {
			relative_path: relative,
			size: metadata.len(),
			mod_time: modified.timestamp_millis(),
		});
	}

	debug!(
		root = %root.display(),
		files = result.discoveries.len(),
		excluded = result.excluded_entries,
		skipped = result.skipped_entries,
		"walked source"
	);
	Ok(result)
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	fn setup_tree(dir: &Path) {
		fs::create_dir_all(dir.join("subdir/deep")).unwrap();
		fs::write(dir.join("root.txt"), "hello").unwrap();
		fs::write(dir.join("subdir/mid.txt"), "ab").unwrap();
		fs::write(dir.join("subdir/deep/bottom.txt"), "abcdefghij").unwrap();
	}

	fn walk(dir: &Path, excludes: &[&str]) -> ScanResult {
		let patterns: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
		walk_source(dir, &compile_excludes(&patterns).unwrap()).unwrap()
	}

	fn paths(result: &ScanResult) -> Vec<&str> {
		let mut paths: Vec<&str> = result.discoveries.iter().map(|d| d.relative_path.as_str()).collect();
		paths.sort();
		paths
	}

	#[test]
	fn walks_nested_dirs() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());

		let result = walk(tmp.path(), &[]);

		assert_eq!(result.skipped_entries, 0);
		assert_eq!(paths(&result), vec!["root.txt", "subdir/deep/bottom.txt", "subdir/mid.txt"]);
	}

	#[test]
	fn reports_correct_sizes() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());

		let result = walk(tmp.path(), &[]);

		// "hello" (5) + "ab" (2) + "abcdefghij" (10)
		assert_eq!(result.total_bytes, 17);
		assert!(result.discoveries.iter().all(|d| d.mod_time > 0));
	}

	#[test]
	fn skips_symlinks() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		std::os::unix::fs::symlink(tmp.path().join("root.txt"), tmp.path().join("link.txt")).unwrap();

		let result = walk(tmp.path(), &[]);

		assert_eq!(result.discoveries.len(), 3); // symlink not counted as a file
		assert_eq!(result.skipped_entries, 1);
	}

	#[test]
	fn excludes_files_and_prunes_dirs() {
		let tmp = tempfile::tempdir().unwrap();
		setup_tree(tmp.path());
		fs::write(tmp.path().join("scratch.tmp"), "x").unwrap();

		let result = walk(tmp.path(), &["*.tmp", "subdir/deep"]);

		assert_eq!(paths(&result), vec!["root.txt", "subdir/mid.txt"]);
		assert_eq!(result.excluded_entries, 2);
	}

	#[test]
	fn empty_dir_returns_zero() {
		let tmp = tempfile::tempdir().unwrap();

		let result = walk(tmp.path(), &[]);

		assert!(result.discoveries.is_empty());
		assert_eq!(result.skipped_entries, 0);
	}

	#[test]
	fn nonexistent_path_errors() {
		let err = walk_source(Path::new("/tmp/ferry_definitely_not_real"), &[]).unwrap_err();
		assert!(matches!(err, ScanError::SourcePathNotExists(_)));
	}

	#[test]
	fn file_not_dir_errors() {
		let tmp = tempfile::tempdir().unwrap();
		let file = tmp.path().join("afile.txt");
		fs::write(&file, "x").unwrap();

		let err = walk_source(&file, &[]).unwrap_err();
		assert!(matches!(err, ScanError::SourcePathNotDir(_)));
	}

	#[test]
	fn bad_pattern_errors() {
		let err = compile_excludes(&["[".to_string()]).unwrap_err();
		assert!(matches!(err, ScanError::BadPattern { .. }));
	}
}
