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

//! The symlink tree mirroring the logical namespace: `links/<name>` is a
//! symlink to `../../blobs/<prefix>/<digest>` whose mtime encodes the
//! logical file's version.

use std::path::{Path, PathBuf};

use filetracker_error::{Code, Error, ResultExt};
use filetracker_util::Digest;

/// A resolved link: the digest it points at and the version recorded as its
/// mtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub digest: Digest,
    pub version: i64,
}

/// Manages `<root>/links/<name>` symlinks. `name` is always the unversioned,
/// leading-slash logical name; callers resolve `@version` suffixes with
/// `filetracker_util::name` before reaching this layer.
pub struct LinkTree {
    root: PathBuf,
}

impl LinkTree {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join("links"))
            .err_tip(|| format!("Failed to create {}", root.join("links").display()))?;
        Ok(LinkTree { root })
    }

    /// Absolute on-disk path for logical `name` (e.g. `"/a/b"`).
    pub fn link_path(&self, name: &str) -> PathBuf {
        self.root.join("links").join(name.trim_start_matches('/'))
    }

    /// Creates or overwrites the link for `name`, pointing it at `digest`
    /// and stamping its mtime with `version`.
    pub fn put(&self, name: &str, digest: &Digest, version: i64) -> Result<(), Error> {
        let path = self.link_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .err_tip(|| format!("Failed to create {}", parent.display()))?;
        }
        let target = self.relative_blob_target(&path, digest);
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(&path)
                .err_tip(|| format!("Failed to remove stale link {}", path.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &path)
            .err_tip(|| format!("Failed to create link {}", path.display()))?;
        #[cfg(not(unix))]
        compile_error!("filetracker-store requires a unix target for symlink support");

        let mtime = filetime::FileTime::from_unix_time(version, 0);
        filetime::set_symlink_file_times(&path, mtime, mtime)
            .err_tip(|| format!("Failed to stamp version on {}", path.display()))?;
        Ok(())
    }

    /// Resolves `name` to its digest and version. `NotFound` if no link
    /// exists, or if it points at a blob that is no longer present
    /// (`InternalInconsistency`, expected to be corrected by `recover`).
    pub fn stat(&self, name: &str) -> Result<LinkEntry, Error> {
        let path = self.link_path(name);
        let meta = path.symlink_metadata().map_err(|_| {
            filetracker_error::make_err!(Code::NotFound, "No such file: {name}")
        })?;
        let target = std::fs::read_link(&path)
            .err_tip(|| format!("Failed to read link {}", path.display()))?;
        let digest_str = target
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| {
                filetracker_error::make_err!(
                    Code::InternalInconsistency,
                    "Link {} has an unparseable target {}",
                    path.display(),
                    target.display()
                )
            })?;
        let digest = Digest::parse(digest_str)
            .err_tip(|| format!("Link {} has a malformed target", path.display()))?;

        let version = filetime::FileTime::from_last_modification_time(&meta).seconds();
        Ok(LinkEntry { digest, version })
    }

    /// Removes the link for `name` (idempotent) and prunes now-empty parent
    /// directories up to `links/`.
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let path = self.link_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).err_tip(|| format!("Failed to remove link {}", path.display())),
        }
        if let Some(parent) = path.parent() {
            filetracker_util::fs_util::prune_empty_dirs(parent, &self.root.join("links"))?;
        }
        Ok(())
    }

    /// Lists every link whose relative path (under `links/`) starts with
    /// `prefix`, returned verbatim as on-disk relative paths (matching the
    /// reference's raw, undecoded `/list` behavior).
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let base = self.root.join("links");
        let resolved = base.join(prefix.trim_start_matches('/'));
        Self::require_dir(&resolved)?;
        let mut out = Vec::new();
        self.walk(&base, &resolved, &mut out)?;
        Ok(out)
    }

    /// Like [`LinkTree::list`], but paired with each link's mtime (its
    /// logical version) so callers can filter by a cutoff without a second
    /// pass over the tree.
    pub fn list_with_mtime(&self, prefix: &str) -> Result<Vec<(String, i64)>, Error> {
        let base = self.root.join("links");
        let resolved = base.join(prefix.trim_start_matches('/'));
        Self::require_dir(&resolved)?;
        let mut out = Vec::new();
        self.walk_with_mtime(&base, &resolved, &mut out)?;
        Ok(out)
    }

    /// `list`/`list_with_mtime` on a prefix whose directory doesn't exist is
    /// a 400, not an empty 200 -- matching the reference server's
    /// `os.path.isdir` check.
    fn require_dir(path: &Path) -> Result<(), Error> {
        if !path.is_dir() {
            return Err(filetracker_error::make_err!(
                Code::InvalidName,
                "Path doesn't exist or is not a directory: {}",
                path.display()
            ));
        }
        Ok(())
    }

    fn walk_with_mtime(&self, links_root: &Path, dir: &Path, out: &mut Vec<(String, i64)>) -> Result<(), Error> {
        let entries = std::fs::read_dir(dir).err_tip(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry.err_tip(|| format!("Failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .err_tip(|| format!("Failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                self.walk_with_mtime(links_root, &path, out)?;
            } else {
                let meta = path
                    .symlink_metadata()
                    .err_tip(|| format!("Failed to stat {}", path.display()))?;
                let mtime = filetime::FileTime::from_last_modification_time(&meta).seconds();
                let relative = path
                    .strip_prefix(links_root)
                    .expect("entries are always under links_root");
                out.push((relative.to_string_lossy().into_owned(), mtime));
            }
        }
        Ok(())
    }

    fn walk(&self, links_root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), Error> {
        let entries = std::fs::read_dir(dir).err_tip(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let entry = entry.err_tip(|| format!("Failed to read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .err_tip(|| format!("Failed to stat {}", path.display()))?;
            if file_type.is_dir() {
                self.walk(links_root, &path, out)?;
            } else {
                let relative = path
                    .strip_prefix(links_root)
                    .expect("entries are always under links_root");
                out.push(relative.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    /// `../../<prefix>/<digest>` relative to the link's own directory, so
    /// the symlink stays valid regardless of where `root` is mounted.
    fn relative_blob_target(&self, link_path: &Path, digest: &Digest) -> PathBuf {
        let depth = link_path
            .strip_prefix(self.root.join("links"))
            .expect("link_path is always under links/")
            .components()
            .count()
            .saturating_sub(1);
        let mut target = PathBuf::new();
        for _ in 0..depth {
            target.push("..");
        }
        target.push("..");
        target.push("blobs");
        target.push(digest.prefix());
        target.push(digest.as_str());
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn digest(c: char) -> Digest {
        Digest::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn put_then_stat_round_trips_digest_and_version() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/b", &digest('a'), 7).unwrap();
        let entry = tree.stat("/a/b").unwrap();
        assert_eq!(entry.digest, digest('a'));
        assert_eq!(entry.version, 7);
    }

    #[test]
    fn put_overwrites_existing_link() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/b", &digest('a'), 1).unwrap();
        tree.put("/a/b", &digest('b'), 2).unwrap();
        let entry = tree.stat("/a/b").unwrap();
        assert_eq!(entry.digest, digest('b'));
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn stat_missing_link_is_not_found() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        let err = tree.stat("/missing").unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[test]
    fn remove_is_idempotent_and_prunes_empty_dirs() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/b/c", &digest('a'), 1).unwrap();
        tree.remove("/a/b/c").unwrap();
        tree.remove("/a/b/c").unwrap();
        assert!(!dir.path().join("links/a").exists());
    }

    #[test]
    fn list_returns_raw_relative_paths_under_prefix() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/one", &digest('a'), 1).unwrap();
        tree.put("/a/two", &digest('b'), 1).unwrap();
        tree.put("/z/three", &digest('c'), 1).unwrap();
        let mut names = tree.list("a").unwrap();
        names.sort();
        assert_eq!(names, vec!["a/one".to_string(), "a/two".to_string()]);
    }

    #[test]
    fn link_target_is_relative_and_resolves_via_symlink_metadata() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/nested/name", &digest('a'), 1).unwrap();
        let link = dir.path().join("links/nested/name");
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.is_relative());
    }

    #[test]
    fn list_on_a_nonexistent_prefix_is_invalid_name() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/one", &digest('a'), 1).unwrap();
        let err = tree.list("never/existed").unwrap_err();
        assert_eq!(err.code, Code::InvalidName);
    }

    #[test]
    fn list_with_mtime_on_a_nonexistent_prefix_is_invalid_name() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        let err = tree.list_with_mtime("never/existed").unwrap_err();
        assert_eq!(err.code, Code::InvalidName);
    }

    #[test]
    fn list_with_mtime_reports_each_links_version() {
        let dir = tempdir().unwrap();
        let tree = LinkTree::new(dir.path()).unwrap();
        tree.put("/a/one", &digest('a'), 10).unwrap();
        tree.put("/a/two", &digest('b'), 20).unwrap();
        let mut entries = tree.list_with_mtime("a").unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![("a/one".to_string(), 10), ("a/two".to_string(), 20)]
        );
    }
}
