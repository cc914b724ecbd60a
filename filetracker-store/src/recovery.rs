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

//! Rebuilds the metadata KV from a scan of `links/` and `blobs/`, for when
//! the two are suspected to have drifted apart (a crash mid-transaction,
//! manual filesystem surgery). Must never run against a root a live server
//! is also serving; enforced by taking the tree lock for the whole pass.

use std::collections::HashMap;
use std::path::Path;

use filetracker_error::{Error, ResultExt};
use filetracker_util::Digest;
use fs4::FileExt;

use crate::blob_store::BlobStore;
use crate::metadata::{DigestRecord, MetadataStore};

/// Summary of what a `recover()` pass found and fixed.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Digests whose `refcount`/`logical_size` in the KV were rewritten to
    /// match the link scan.
    pub repaired_digests: Vec<Digest>,
    /// Links whose target blob no longer exists on disk; the link itself
    /// was removed.
    pub removed_dangling_links: Vec<String>,
    /// Blobs with zero incoming links after the scan; the blob was deleted.
    pub removed_orphan_blobs: Vec<Digest>,
}

/// Walks `root/links` and `root/blobs`, recomputing every digest's refcount
/// and logical size from scratch and writing the result back into
/// `root/db`. Orphan blobs (no incoming links) are deleted; dangling links
/// (target blob missing) are deleted.
pub fn recover(root: &Path) -> Result<RecoveryReport, Error> {
    let tree_lock_path = root.join("locks").join("tree.lock");
    std::fs::create_dir_all(root.join("locks"))
        .err_tip(|| format!("Failed to create {}", root.join("locks").display()))?;
    let tree_lock = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&tree_lock_path)
        .err_tip(|| format!("Failed to open {}", tree_lock_path.display()))?;
    FileExt::lock_exclusive(&tree_lock).err_tip(|| "Failed to acquire tree lock for recovery".to_string())?;

    let result = recover_locked(root);

    let _ = FileExt::unlock(&tree_lock);
    result
}

fn recover_locked(root: &Path) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport::default();
    let mut refcounts: HashMap<Digest, u64> = HashMap::new();

    let links_root = root.join("links");
    walk_links(&links_root, &links_root, &root.join("blobs"), &mut report, &mut refcounts)?;

    let blob_store = BlobStore::new(root)?;
    let on_disk_digests = walk_blob_digests(&root.join("blobs"))?;

    for digest in &on_disk_digests {
        if !refcounts.contains_key(digest) {
            blob_store.remove(digest)?;
            report.removed_orphan_blobs.push(digest.clone());
        }
    }

    let metadata = MetadataStore::open(&root.join("db"))?;
    let previously_tracked: HashMap<Digest, DigestRecord> = metadata.iter()?.into_iter().collect();

    for digest in previously_tracked.keys() {
        if !refcounts.contains_key(digest) {
            metadata.remove(digest)?;
        }
    }

    for (digest, refcount) in &refcounts {
        let logical_size = match previously_tracked.get(digest) {
            Some(existing) if existing.refcount == *refcount => existing.logical_size,
            _ => {
                let (_, size) = BlobStore::hash_and_size(&blob_store.blob_path(digest), true)?;
                size
            }
        };
        let record = DigestRecord {
            refcount: *refcount,
            logical_size,
        };
        if previously_tracked.get(digest) != Some(&record) {
            metadata.set(digest, record)?;
            report.repaired_digests.push(digest.clone());
        }
    }

    Ok(report)
}

fn walk_links(
    links_root: &Path,
    dir: &Path,
    blobs_root: &Path,
    report: &mut RecoveryReport,
    refcounts: &mut HashMap<Digest, u64>,
) -> Result<(), Error> {
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
            walk_links(links_root, &path, blobs_root, report, refcounts)?;
            continue;
        }
        if !file_type.is_symlink() {
            continue;
        }
        let target = std::fs::read_link(&path)
            .err_tip(|| format!("Failed to read link {}", path.display()))?;
        let digest_str = target.file_name().and_then(|f| f.to_str());
        let resolved = digest_str
            .and_then(|s| Digest::parse(s).ok())
            .filter(|digest| blobs_root.join(digest.prefix()).join(digest.as_str()).is_file());

        match resolved {
            Some(digest) => {
                *refcounts.entry(digest).or_insert(0) += 1;
            }
            None => {
                let _ = std::fs::remove_file(&path);
                let relative = path
                    .strip_prefix(links_root)
                    .expect("entries are always under links_root");
                report
                    .removed_dangling_links
                    .push(relative.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

fn walk_blob_digests(blobs_root: &Path) -> Result<Vec<Digest>, Error> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(blobs_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).err_tip(|| format!("Failed to list {}", blobs_root.display())),
    };
    for prefix_entry in entries {
        let prefix_entry =
            prefix_entry.err_tip(|| format!("Failed to read entry in {}", blobs_root.display()))?;
        if !prefix_entry
            .file_type()
            .err_tip(|| "Failed to stat blob prefix directory".to_string())?
            .is_dir()
        {
            continue;
        }
        for digest_entry in std::fs::read_dir(prefix_entry.path())
            .err_tip(|| format!("Failed to list {}", prefix_entry.path().display()))?
        {
            let digest_entry = digest_entry.err_tip(|| "Failed to read blob entry".to_string())?;
            if let Some(name) = digest_entry.file_name().to_str() {
                if let Ok(digest) = Digest::parse(name) {
                    out.push(digest);
                }
            }
        }
    }
    Ok(out)
}
