//! Locked, atomic JSON persistence for Rover's run state. Every write takes
//! an exclusive advisory lock, writes to a sibling tmp file, fsyncs, then
//! renames over the destination — the same write discipline the prior
//! TOML-based state manager used, generalized to an arbitrary JSON type and
//! shared by every `.rover/*.json` file.

use std::fs;
use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A single JSON file guarded by a `.lock` sibling, holding a `T` with a
/// `Default` fallback when the file does not exist yet.
pub struct JsonStore<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Load `T` from disk. A missing file yields `T::default()`. A file that
    /// exists but fails to parse is a `Corruption` error — the caller
    /// decides whether to surface it or reset, it is never silently
    /// swallowed here.
    pub fn load(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| Error::Corruption {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    /// Write `value` atomically: write-to-tmp, fsync, rename.
    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Storage(format!("failed to serialize {}: {e}", self.path.display())))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        use std::io::Write;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load, mutate, save — all under an exclusive lock, so two concurrent
    /// processes never interleave a load-modify-save cycle.
    pub fn modify<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = self.lock_path();
        let lock = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)?;

        let ret = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(Error::Storage(format!(
                "failed to acquire lock on {}: {}",
                lock_path.display(),
                std::io::Error::last_os_error()
            )));
        }

        let mut value = self.load()?;
        let result = f(&mut value);
        self.save(&value)?;
        Ok(result)
        // lock released when `lock` drops
    }
}

/// The `.rover` directory rooted at a target path.
pub fn rover_dir(target: &Path) -> PathBuf {
    target.join(".rover")
}

pub fn issue_store_path(target: &Path) -> PathBuf {
    rover_dir(target).join("issues.json")
}

pub fn batch_state_path(target: &Path) -> PathBuf {
    rover_dir(target).join("batch-run-state.json")
}

pub fn fix_state_path(target: &Path) -> PathBuf {
    rover_dir(target).join("fix-state.json")
}

pub fn fix_trace_path(target: &Path, issue_id: &str) -> PathBuf {
    rover_dir(target).join("traces").join(format!("{issue_id}.json"))
}

pub fn plans_dir(target: &Path) -> PathBuf {
    rover_dir(target).join("plans")
}

pub fn memory_path(target: &Path) -> PathBuf {
    rover_dir(target).join("memory.md")
}
