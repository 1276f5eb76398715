use std::path::Path;

/// Prefix of every content-version hash. `psm` = path, size, mtime.
const HASH_URN_PREFIX: &str = "urn:psm:";

/// Deterministic local id for a file: `file://` + the source base joined with the
/// relative path. Stable across re-scans of the same logical file.
pub fn file_id(base_path: &Path, relative_path: &str) -> String {
	format!("file://{}", base_path.join(relative_path).display())
}

/// Content-version hash over (id, size, mtime in Unix milliseconds).
///
/// This is a cheap proxy for "the file changed", not a digest of the bytes.
/// A file rewritten within one timestamp tick and restored to the same size
/// keeps its hash.
pub fn content_hash(id: &str, size: u64, mod_time: i64) -> String {
	format!("{HASH_URN_PREFIX}{id}-{size}-{mod_time}")
}
