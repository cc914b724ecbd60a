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

//! The client-side cache: a much simpler degenerate form of the server's
//! storage engine. There is no sharing between processes to arbitrate with
//! metadata or de-duplication, so a cached file is a plain file whose mtime
//! *is* its version, hardlinked out to the caller on a hit.

use std::path::{Path, PathBuf};

use filetracker_error::{Code, Error, ResultExt};
use filetracker_util::{fs_util, name};

/// One cached logical file's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub version: i64,
}

/// One entry returned by [`LocalStore::list`]: a cached file's versioned
/// name, version, and size, for a cache cleaner to decide what to evict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfoEntry {
    pub versioned_name: String,
    pub mtime: i64,
    pub size: u64,
}

/// A local cache directory (`FILETRACKER_DIR`, default `~/.filetracker-store`)
/// mirroring the logical namespace as plain files rather than a symlink
/// tree, since there's exactly one writer (this process) and no blob
/// de-duplication to arbitrate.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .err_tip(|| format!("Failed to create cache directory {}", root.display()))?;
        Ok(LocalStore { root })
    }

    /// On-disk path for a cached logical `name`.
    pub fn path(&self, logical_name: &str) -> PathBuf {
        self.root.join(logical_name.trim_start_matches('/'))
    }

    /// The version currently cached for `logical_name`, read from the
    /// file's mtime, or `None` if nothing is cached.
    pub fn cached_version(&self, logical_name: &str) -> Result<Option<CacheEntry>, Error> {
        name::validate(logical_name, false)?;
        let path = self.path(logical_name);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(CacheEntry {
                version: filetime::FileTime::from_last_modification_time(&meta).seconds(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).err_tip(|| format!("Failed to stat {}", path.display())),
        }
    }

    /// Copies `source` into the cache as `logical_name` at `version`,
    /// hardlinking when possible so a warm cache costs no extra disk space
    /// once the destination the caller asked for is also a hardlink target.
    pub fn store_from_path(&self, logical_name: &str, version: i64, source: &Path) -> Result<(), Error> {
        name::validate(logical_name, false)?;
        let dest = self.path(logical_name);
        fs_util::hardlink_or_copy(source, &dest)?;
        let mtime = filetime::FileTime::from_unix_time(version, 0);
        filetime::set_file_mtime(&dest, mtime)
            .err_tip(|| format!("Failed to stamp version on {}", dest.display()))?;
        Ok(())
    }

    /// Materializes the cached copy of `logical_name` at `dest`, hardlinking
    /// when the two paths are on the same filesystem.
    pub fn link_out(&self, logical_name: &str, dest: &Path) -> Result<(), Error> {
        let cached = self.path(logical_name);
        if !cached.is_file() {
            return Err(filetracker_error::make_err!(
                Code::NotFound,
                "{logical_name} is not cached locally"
            ));
        }
        fs_util::hardlink_or_copy(&cached, dest)
    }

    /// Removes a cached entry. Idempotent.
    pub fn remove(&self, logical_name: &str) -> Result<(), Error> {
        let path = self.path(logical_name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).err_tip(|| format!("Failed to remove {}", path.display())),
        }
        if let Some(parent) = path.parent() {
            fs_util::prune_empty_dirs(parent, &self.root)?;
        }
        Ok(())
    }

    /// Walks the whole cache, returning one entry per cached file. Order is
    /// unspecified.
    pub fn list(&self) -> Result<Vec<FileInfoEntry>, Error> {
        let mut out = Vec::new();
        self.walk(&self.root.clone(), &mut out)?;
        Ok(out)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<FileInfoEntry>) -> Result<(), Error> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).err_tip(|| format!("Failed to list {}", dir.display())),
        };
        for entry in entries {
            let entry = entry.err_tip(|| format!("Failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .err_tip(|| format!("Failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
                continue;
            }
            let meta = entry
                .metadata()
                .err_tip(|| format!("Failed to stat {}", path.display()))?;
            let mtime = filetime::FileTime::from_last_modification_time(&meta).seconds();
            let relative = path
                .strip_prefix(&self.root)
                .expect("walk only visits entries under root")
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            out.push(FileInfoEntry {
                versioned_name: name::join(&format!("/{relative}"), mtime),
                mtime,
                size: meta.len(),
            });
        }
        Ok(())
    }
}
