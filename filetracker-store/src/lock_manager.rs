// Copyright 2023 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named exclusive/shared locks backed by `flock(2)`, one per link path or
//! blob digest. Acquisition is cooperative: a contended lock is retried
//! with a short sleep between attempts (so the tokio scheduler can make
//! progress on other requests) up to a bounded number of times before
//! failing with `Code::ConcurrentModification`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetracker_config::LockRetryConfig;
use filetracker_error::{make_err, Code, Error, ResultExt};
use fs4::FileExt;

/// An open, as-yet-unlocked handle to a named lock file. Call
/// [`FileLock::lock_shared`] or [`FileLock::lock_exclusive`] before relying
/// on mutual exclusion.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock in shared (reader) mode, retrying on contention.
    pub async fn lock_shared(&self, retry: LockRetryConfig) -> Result<(), Error> {
        self.acquire(retry, true).await
    }

    /// Acquires the lock in exclusive (writer) mode, retrying on contention.
    pub async fn lock_exclusive(&self, retry: LockRetryConfig) -> Result<(), Error> {
        self.acquire(retry, false).await
    }

    /// Releases the lock. A no-op if the lock was never acquired.
    pub fn unlock(&self) -> Result<(), Error> {
        FileExt::unlock(&self.file).err_tip(|| format!("Failed to unlock {}", self.path.display()))
    }

    async fn acquire(&self, retry: LockRetryConfig, shared: bool) -> Result<(), Error> {
        for attempt in 0..retry.attempts {
            // `try_lock_*` never blocks, so it's safe to call directly from
            // the async task instead of bouncing to a blocking thread.
            let acquired = if shared {
                FileExt::try_lock_shared(&self.file)
            } else {
                FileExt::try_lock_exclusive(&self.file)
            };
            match acquired {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tracing::debug!(
                        path = %self.path.display(),
                        attempt,
                        "lock contended, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(retry.delay_ms)).await;
                }
                Err(e) => {
                    return Err(e).err_tip(|| format!("Failed to lock {}", self.path.display()))
                }
            }
        }
        Err(make_err!(
            Code::ConcurrentModification,
            "Exhausted {} attempts acquiring lock on {}",
            retry.attempts,
            self.path.display()
        ))
    }
}

/// Factory for [`FileLock`]s rooted under a single `locks/` directory.
/// Mirrors the reference `FcntlLockManager`: a tree-wide lock guards the
/// mkdir/open of a freshly-used lock path so two workers never race on the
/// intermediate directories of a name neither has used before.
pub struct LockManager {
    root: PathBuf,
    tree_lock_path: PathBuf,
    retry: LockRetryConfig,
}

impl LockManager {
    pub fn new(root: impl Into<PathBuf>, retry: LockRetryConfig) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .err_tip(|| format!("Failed to create lock root {}", root.display()))?;
        let tree_lock_path = root.join("tree.lock");
        if !tree_lock_path.exists() {
            File::create(&tree_lock_path)
                .err_tip(|| format!("Failed to create {}", tree_lock_path.display()))?;
        }
        Ok(LockManager {
            root,
            tree_lock_path,
            retry,
        })
    }

    pub fn retry_config(&self) -> LockRetryConfig {
        self.retry
    }

    /// Opens (creating if needed) the lock file for `relative_name` under
    /// `root`, e.g. `"links/foo/bar"` or `"blobs/<digest>"`. Does not itself
    /// acquire the lock -- call `lock_shared`/`lock_exclusive` on the
    /// result.
    pub fn create_lock(&self, relative_name: &str) -> Result<FileLock, Error> {
        let path = self.root.join(relative_name.trim_start_matches('/'));

        let tree_lock = File::open(&self.tree_lock_path)
            .err_tip(|| format!("Failed to open {}", self.tree_lock_path.display()))?;
        FileExt::lock_exclusive(&tree_lock)
            .err_tip(|| "Failed to acquire tree lock".to_string())?;
        let result = (|| -> Result<File, Error> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .err_tip(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .err_tip(|| format!("Failed to create lock file {}", path.display()))?;
            // So a lock-file cleaner may reap lock files untouched for a
            // while; the reference touches this on every acquisition too.
            let _ = filetime::set_file_mtime(&path, filetime::FileTime::now());
            Ok(file)
        })();
        let _ = FileExt::unlock(&tree_lock);

        Ok(FileLock {
            file: result?,
            path,
        })
    }

    /// Removes a lock file and prunes now-empty parent directories, under
    /// the tree-wide guard. Only safe to call when nothing else holds the
    /// lock.
    pub fn remove_lock(&self, lock: &FileLock) -> Result<(), Error> {
        let tree_lock = File::open(&self.tree_lock_path)
            .err_tip(|| format!("Failed to open {}", self.tree_lock_path.display()))?;
        FileExt::lock_exclusive(&tree_lock)
            .err_tip(|| "Failed to acquire tree lock".to_string())?;
        let _ = std::fs::remove_file(lock.path());
        if let Some(parent) = lock.path().parent() {
            let _ = filetracker_util::fs_util::prune_empty_dirs(parent, &self.root);
        }
        let _ = FileExt::unlock(&tree_lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_retry() -> LockRetryConfig {
        LockRetryConfig {
            attempts: 3,
            delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn exclusive_lock_excludes_other_exclusive_attempts() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path(), test_retry()).unwrap();
        let lock_a = manager.create_lock("links/foo").unwrap();
        lock_a.lock_exclusive(test_retry()).await.unwrap();

        let lock_b = manager.create_lock("links/foo").unwrap();
        let result = lock_b.lock_exclusive(test_retry()).await;
        assert!(result.is_err());

        lock_a.unlock().unwrap();
        lock_b.lock_exclusive(test_retry()).await.unwrap();
    }

    #[tokio::test]
    async fn shared_locks_do_not_exclude_each_other() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path(), test_retry()).unwrap();
        let lock_a = manager.create_lock("links/foo").unwrap();
        let lock_b = manager.create_lock("links/foo").unwrap();
        lock_a.lock_shared(test_retry()).await.unwrap();
        lock_b.lock_shared(test_retry()).await.unwrap();
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path(), test_retry()).unwrap();
        let lock_a = manager.create_lock("links/foo").unwrap();
        let lock_b = manager.create_lock("links/bar").unwrap();
        lock_a.lock_exclusive(test_retry()).await.unwrap();
        lock_b.lock_exclusive(test_retry()).await.unwrap();
    }

    #[tokio::test]
    async fn remove_lock_prunes_empty_parent_dirs() {
        let dir = tempdir().unwrap();
        let manager = LockManager::new(dir.path(), test_retry()).unwrap();
        let lock = manager.create_lock("links/a/b/c").unwrap();
        manager.remove_lock(&lock).unwrap();
        assert!(!dir.path().join("links/a").exists());
    }
}
