use crate::error::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Exact content hash of a downloaded payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        ContentHash(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn of_file(path: &Path) -> Result<Self> {
        Ok(Self::of_bytes(&fs::read(path)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hashes of every payload already written for an identity, so the same
/// bytes served under different URLs are stored once.
#[derive(Debug, Default)]
pub struct ContentIndex {
    seen: HashSet<ContentHash>,
}

impl ContentIndex {
    /// Seed from files already on disk. Unreadable files are skipped.
    pub fn from_files(paths: &[PathBuf]) -> Self {
        let seen = paths
            .par_iter()
            .filter_map(|path| match ContentHash::of_file(path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    log::debug!("Skipping {} while indexing: {}", path.display(), e);
                    None
                }
            })
            .collect();
        Self { seen }
    }

    /// Returns `false` when the bytes were already present.
    pub fn insert(&mut self, bytes: &[u8]) -> bool {
        self.seen.insert(ContentHash::of_bytes(bytes))
    }

    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.seen.contains(&ContentHash::of_bytes(bytes))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
