//! On-disk layout of the storage root.
//!
//! ```text
//! <root>/
//!   .staging/            in-progress clones, purged at startup
//!   git/<sha256>/        one directory per mirror
//!   hg/<sha256>/
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::record::MirrorKey;

pub const STAGING_DIR: &str = ".staging";

/// Deterministic, collision-free directory for a mirror.
pub fn mirror_path(root: &Path, key: &MirrorKey) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(key.upstream.as_bytes());
    root.join(key.kind.as_str())
        .join(hex::encode(hasher.finalize()))
}

pub fn staging_dir(root: &Path) -> PathBuf {
    root.join(STAGING_DIR)
}
