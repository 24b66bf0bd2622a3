//! Snapshot file for durable [`MemoryEngine`](super::MemoryEngine) instances.
//!
//! Every commit rewrites the whole snapshot: serialize to a temp file in the same
//! directory, fsync, then atomically rename over the previous snapshot. Commits from
//! separate processes are serialized by a guard file created with `create_new`.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::catalog::Catalog;
use crate::core::{EngineError, EngineResult};

const SNAPSHOT_FORMAT: u32 = 1;
const SNAPSHOT_FILE: &str = "rustmigrate.snapshot";
const GUARD_FILE: &str = "rustmigrate.commit.lock";

/// A guard older than this is considered left behind by a crashed process.
const STALE_GUARD_AGE: Duration = Duration::from_secs(30);
const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    format: u32,
    version: u64,
    saved_at: DateTime<Utc>,
    catalog: Catalog,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshot_path: PathBuf,
    guard_path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> EngineResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).map_err(|e| {
            EngineError::Storage(format!(
                "Failed to create data directory '{}': {}",
                data_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            snapshot_path: data_dir.join(SNAPSHOT_FILE),
            guard_path: data_dir.join(GUARD_FILE),
        })
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Loads the last committed catalog and its version, if a snapshot exists.
    pub fn load(&self) -> EngineResult<Option<(u64, Catalog)>> {
        let mut file = match File::open(&self.snapshot_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::Storage(format!("Failed to open snapshot: {}", e)));
            }
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| EngineError::Storage(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: SnapshotFile = rmp_serde::from_slice(&data)
            .map_err(|e| EngineError::Storage(format!("Failed to deserialize snapshot: {}", e)))?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(EngineError::Storage(format!(
                "Unsupported snapshot format {} (expected {})",
                snapshot.format, SNAPSHOT_FORMAT
            )));
        }
        Ok(Some((snapshot.version, snapshot.catalog)))
    }

    pub fn save(&self, catalog: &Catalog, version: u64) -> EngineResult<()> {
        let snapshot = SnapshotFile {
            format: SNAPSHOT_FORMAT,
            version,
            saved_at: Utc::now(),
            catalog: catalog.clone(),
        };
        let serialized = rmp_serde::to_vec_named(&snapshot)
            .map_err(|e| EngineError::Storage(format!("Failed to serialize snapshot: {}", e)))?;

        let dir = self
            .snapshot_path
            .parent()
            .ok_or_else(|| EngineError::Storage("Snapshot path has no parent directory".into()))?;
        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| EngineError::Storage(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| EngineError::Storage(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| EngineError::Storage(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| EngineError::Storage(format!("Failed to replace snapshot: {}", e)))?;

        debug!("Snapshot version {} written to {}", version, self.snapshot_path.display());
        Ok(())
    }

    /// Waits up to `timeout` for exclusive commit rights across processes.
    ///
    /// The guard file holds `<pid> <token>` of its owner. A guard is only broken when it
    /// is older than `STALE_GUARD_AGE` and its process is gone.
    pub async fn lock_commits(&self, timeout: Duration) -> EngineResult<CommitGuard> {
        let deadline = Instant::now() + timeout;
        let holder = format!("{} {}", std::process::id(), Uuid::new_v4());
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.guard_path)
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(holder.as_bytes()).and_then(|()| file.sync_all()) {
                        remove_guard_file(&self.guard_path);
                        return Err(EngineError::Storage(format!(
                            "Failed to write commit guard: {}",
                            e
                        )));
                    }
                    return Ok(CommitGuard {
                        path: self.guard_path.clone(),
                        holder,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_stale_guard() {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(EngineError::TransactionAborted(format!(
                            "Timed out waiting for commit guard {}",
                            self.guard_path.display()
                        )));
                    }
                    tokio::time::sleep(GUARD_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(EngineError::Storage(format!(
                        "Failed to create commit guard: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Removes a guard left by a dead process. Returns `true` if this call removed it.
    fn break_stale_guard(&self) -> bool {
        let Some(holder) = read_holder(&self.guard_path) else {
            return false;
        };
        if !file_older_than(&self.guard_path, STALE_GUARD_AGE) || holder_is_alive(&holder) {
            return false;
        }

        // Rename first: of several processes breaking the same guard only one succeeds.
        let aside = self
            .guard_path
            .with_extension(format!("stale-{}", Uuid::new_v4().simple()));
        if let Err(e) = fs::rename(&self.guard_path, &aside) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to move stale commit guard {}: {}", self.guard_path.display(), e);
            }
            return false;
        }

        if read_holder(&aside).as_deref() != Some(holder.as_str()) {
            // A live guard replaced the stale one before the rename; put it back.
            if let Err(e) = fs::hard_link(&aside, &self.guard_path) {
                warn!("Failed to restore commit guard {}: {}", self.guard_path.display(), e);
            }
            remove_guard_file(&aside);
            return false;
        }

        warn!(
            "Removed stale commit guard {} held by '{}'",
            self.guard_path.display(),
            holder.trim()
        );
        remove_guard_file(&aside);
        true
    }
}

fn read_holder(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn file_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

/// Whether the process named in a guard may still be committing. Without a pid, or
/// without `/proc` to ask, only the guard's age counts.
fn holder_is_alive(holder: &str) -> bool {
    let Some(pid) = holder
        .split_whitespace()
        .next()
        .and_then(|pid| pid.parse::<u32>().ok())
    else {
        return false;
    };
    if pid == std::process::id() {
        return true;
    }
    let proc_dir = Path::new("/proc");
    proc_dir.is_dir() && proc_dir.join(pid.to_string()).exists()
}

fn remove_guard_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove commit guard {}: {}", path.display(), e);
        }
    }
}

/// Removes the commit guard file when dropped, unless another process has since
/// replaced it.
#[derive(Debug)]
pub struct CommitGuard {
    path: PathBuf,
    holder: String,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        match read_holder(&self.path) {
            Some(holder) if holder == self.holder => remove_guard_file(&self.path),
            Some(_) => warn!("Commit guard {} was taken over", self.path.display()),
            None => warn!("Commit guard {} disappeared while held", self.path.display()),
        }
    }
}
