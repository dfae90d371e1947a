//! Backup archives and the backup index
//!
//! A backup is a gzip tar of an instance directory, minus the lockfile,
//! written with a stable entry order so the same directory always yields
//! the same archive. Backups are indexed in `backup/index.json`.

use crate::datadir::LOCK_FILE;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Index entry for one backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupInfo {
    pub id: String,
    pub instance_id: String,
    pub url: String,
    pub version: String,
    pub commit: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
}

/// The on-disk backup index
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupIndex {
    pub version: u32,
    pub backups: HashMap<String, BackupInfo>,
}

impl BackupIndex {
    const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            backups: HashMap::new(),
        }
    }

    /// Load the index, yielding an empty one when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn add(&mut self, info: BackupInfo) {
        self.backups.insert(info.id.clone(), info);
    }

    pub fn get(&self, id: &str) -> Option<&BackupInfo> {
        self.backups.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<BackupInfo> {
        self.backups.remove(id)
    }

    /// All backups, newest first
    pub fn list(&self) -> Vec<BackupInfo> {
        let mut list: Vec<BackupInfo> = self.backups.values().cloned().collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        list
    }
}

/// Derive a backup id from the instance and the moment it was taken
pub fn backup_id(instance_id: &str, timestamp: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(b"-");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Produce a gzip tar of `src_dir` at `dest`, excluding the lockfile.
/// Entries are appended in sorted order so the archive is reproducible.
/// Returns the archive size in bytes.
pub fn create_archive(src_dir: &Path, dest: &Path) -> Result<u64> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut entries = Vec::new();
    collect_entries(src_dir, src_dir, &mut entries)?;
    entries.sort();

    for rel in &entries {
        let path = src_dir.join(rel);
        if path.is_dir() {
            builder.append_dir(rel, &path)?;
        } else {
            builder.append_path_with_name(&path, rel)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;

    Ok(std::fs::metadata(dest)?.len())
}

/// Unpack an archive produced by `create_archive` into `dest_dir`
pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<()> {
    if !archive.exists() {
        return Err(CoreError::BackupNotFound(
            archive.to_string_lossy().to_string(),
        ));
    }
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest_dir)?;
    Ok(())
}

/// Collect relative paths below `dir`, skipping the root lockfile
fn collect_entries(dir: &Path, base: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(base)
            .expect("walked path is below base")
            .to_path_buf();

        if rel == Path::new(LOCK_FILE) {
            continue;
        }

        out.push(rel.clone());
        if path.is_dir() {
            collect_entries(&path, base, out)?;
        }
    }
    Ok(())
}
