//! Per-plan mutual exclusion hook.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use tracing::debug;

/// Acquired before and released after each `run_next_phase` call.
#[async_trait]
pub trait PlanLock: Send + Sync {
    async fn acquire(&self, plan_id: &str) -> Result<()>;
    async fn release(&self, plan_id: &str) -> Result<()>;
}

/// Advisory OS locks on `<dir>/<plan_id>.lock`.
///
/// The lock is held on an open handle, so it disappears with the process:
/// a lock file left behind by a crashed run is simply re-locked. The file
/// records the holder's pid for diagnostics only.
#[derive(Debug)]
pub struct FileLock {
    dir: PathBuf,
    held: Mutex<HashMap<String, File>>,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", plan_id))
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, File>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn holder(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn record_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

fn locked_error(plan_id: &str, path: &Path) -> anyhow::Error {
    anyhow::anyhow!(
        "Plan '{}' is locked by process {} ({})",
        plan_id,
        holder(path),
        path.display()
    )
}

#[async_trait]
impl PlanLock for FileLock {
    async fn acquire(&self, plan_id: &str) -> Result<()> {
        let path = self.path(plan_id);
        let mut held = self.held();
        if held.contains_key(plan_id) {
            return Err(locked_error(plan_id, &path));
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create lock directory {}", self.dir.display()))?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(locked_error(plan_id, &path));
            }
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        record_pid(&mut file).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(plan_id, path = %path.display(), "Acquired plan lock");
        held.insert(plan_id.to_string(), file);
        Ok(())
    }

    async fn release(&self, plan_id: &str) -> Result<()> {
        let Some(file) = self.held().remove(plan_id) else {
            return Ok(());
        };
        // The file stays; removing it would race with a waiting acquirer
        file.set_len(0).ok();
        FileExt::unlock(&file).with_context(|| format!("Failed to unlock {}", self.path(plan_id).display()))?;
        debug!(plan_id, "Released plan lock");
        Ok(())
    }
}
