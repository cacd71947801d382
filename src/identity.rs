use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Version prefix for quick hashes - increment to invalidate all cached metadata
const QUICK_HASH_VERSION: &str = "v1";

/// File identity information used for cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// File size in bytes
    pub size: u64,
    /// Modification time in nanoseconds since UNIX epoch
    pub mtime_ns: u128,
}

/// Get file identity information. Missing files produce a zeroed identity.
pub fn get_file_identity(path: &Path) -> FileIdentity {
    let metadata = path.metadata().ok();

    let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);

    let mtime_ns = metadata
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(|t| t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos())
        .unwrap_or(0);

    FileIdentity { size, mtime_ns }
}

/// Cheap identity of a file built from its name, size and modification time.
///
/// This is not a content hash: a file replaced by different bytes with the
/// same size and mtime keeps its quick hash.
pub fn quick_hash(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let identity = get_file_identity(path);
    quick_hash_parts(&name, &identity)
}

pub fn quick_hash_parts(name: &str, identity: &FileIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(QUICK_HASH_VERSION.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(identity.size.to_be_bytes());
    hasher.update(identity.mtime_ns.to_be_bytes());
    let result = hasher.finalize();
    format!("{:x}", result)[..16].to_string()
}
