use std::{
    fs::{self, File, OpenOptions},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, LockConfig},
    error::{Error, Result},
    registry::JobRegistry,
};

/// Exclusive advisory lock next to the job table, released on drop.
#[derive(Debug)]
pub struct TableLock {
    file: File,
    path: PathBuf,
}

pub fn lock_path(table_path: &Path) -> PathBuf {
    let mut name = table_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    table_path.with_file_name(name)
}

impl TableLock {
    /// Retries with doubling backoff while another process holds the lock,
    /// fails with `Error::Locked` once the retries are used up.
    /// Waiting yields to the runtime, other tasks keep running.
    pub async fn acquire(table_path: &Path, config: &LockConfig) -> Result<Self> {
        let path = lock_path(table_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let contended = fs2::lock_contended_error().kind();
        let mut backoff = Duration::from_millis(config.backoff_ms);
        let max_backoff = Duration::from_millis(config.max_backoff_ms);
        let mut attempt = 0;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    debug!("acquired {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(err) if err.kind() == contended => {
                    if attempt >= config.retries {
                        warn!("giving up on {} after {} retries", path.display(), attempt);
                        return Err(Error::Locked(path));
                    }
                    if attempt == 0 {
                        info!("{} is held by another process, waiting", path.display());
                    }
                    attempt += 1;
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("could not release {}: {}", self.path.display(), err);
        } else {
            debug!("released {}", self.path.display());
        }
    }
}

/// A registry that may only be used while its table lock is held.
pub struct LockedRegistry {
    registry: JobRegistry,
    // dropped after the registry
    _lock: TableLock,
}

impl LockedRegistry {
    pub async fn open(config: &Config) -> Result<Self> {
        let table_path = config.table_path();
        let lock = TableLock::acquire(&table_path, &config.lock).await?;
        let registry = JobRegistry::open(&table_path)?;
        Ok(Self {
            registry,
            _lock: lock,
        })
    }
}

impl Deref for LockedRegistry {
    type Target = JobRegistry;

    fn deref(&self) -> &Self::Target {
        &self.registry
    }
}

impl DerefMut for LockedRegistry {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.registry
    }
}
