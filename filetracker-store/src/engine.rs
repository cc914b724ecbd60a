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

//! `StorageEngine` ties the blob store, link tree, metadata KV and lock
//! manager together into the four operations a server exposes: store,
//! fetch-stat, delete, and list.
//!
//! Lock ordering is always link-name first, then blob digest, both here and
//! in `recovery::recover`, so two concurrent operations on overlapping names
//! and digests can never deadlock against each other.

use std::io::Read;
use std::path::PathBuf;

use filetracker_config::LockRetryConfig;
use filetracker_error::Error;
use filetracker_util::{name, Digest};

use crate::blob_store::BlobStore;
use crate::link_tree::{LinkEntry, LinkTree};
use crate::lock_manager::LockManager;
use crate::metadata::MetadataStore;

/// Outcome of a successful `store`: what actually ended up on disk, which
/// may differ from the request if the digest was already de-duplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub digest: Digest,
    pub logical_size: u64,
    pub version: i64,
}

pub struct StorageEngine {
    blobs: BlobStore,
    links: LinkTree,
    metadata: MetadataStore,
    locks: LockManager,
    retry: LockRetryConfig,
}

impl StorageEngine {
    /// Opens (creating if necessary) the full on-disk layout rooted at
    /// `root`: `blobs/`, `links/`, `locks/`, `db/`, `tmp/`.
    pub fn open(root: impl Into<PathBuf>, retry: LockRetryConfig) -> Result<Self, Error> {
        let root = root.into();
        let blobs = BlobStore::new(&root)?;
        let links = LinkTree::new(&root)?;
        let metadata = MetadataStore::open(&root.join("db"))?;
        let locks = LockManager::new(root.join("locks"), retry)?;
        Ok(StorageEngine {
            blobs,
            links,
            metadata,
            locks,
            retry,
        })
    }

    /// Stores `src` under `name` at `version`, de-duplicating against any
    /// existing blob with the same digest. `hint` lets a caller that already
    /// knows the digest and logical size (e.g. the client, which hashed the
    /// file locally) skip re-hashing server-side.
    ///
    /// Per invariant 6, a `store` with a version older than what's already
    /// recorded for `name` is a no-op: the existing version is returned
    /// unchanged and `src` is never even materialized.
    pub async fn store<R: Read>(
        &self,
        logical_name: &str,
        version: i64,
        src: R,
        size_hint: u64,
        compressed: bool,
        hint: Option<(Digest, u64)>,
    ) -> Result<StoreOutcome, Error> {
        name::validate(logical_name, false)?;

        let link_lock = self.locks.create_lock(&format!("links{logical_name}"))?;
        link_lock.lock_exclusive(self.retry).await?;
        let result = self
            .store_locked(logical_name, version, src, size_hint, compressed, hint)
            .await;
        let _ = link_lock.unlock();
        result
    }

    async fn store_locked<R: Read>(
        &self,
        logical_name: &str,
        version: i64,
        src: R,
        size_hint: u64,
        compressed: bool,
        hint: Option<(Digest, u64)>,
    ) -> Result<StoreOutcome, Error> {
        if let Some(outcome) = self.existing_if_newer(logical_name, version)? {
            return Ok(outcome);
        }

        let temp = self.blobs.stage(src, size_hint)?;
        self.finish_store(logical_name, version, temp, compressed, hint)
            .await
    }

    /// Like [`StorageEngine::store`] but streams `src` from an
    /// `AsyncRead` instead of a blocking `Read`, so a server handler backed
    /// by a request-body stream never has to buffer the whole upload before
    /// writing any of it to disk.
    pub async fn store_stream<R>(
        &self,
        logical_name: &str,
        version: i64,
        src: R,
        size_hint: u64,
        compressed: bool,
        hint: Option<(Digest, u64)>,
    ) -> Result<StoreOutcome, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        name::validate(logical_name, false)?;

        let link_lock = self.locks.create_lock(&format!("links{logical_name}"))?;
        link_lock.lock_exclusive(self.retry).await?;
        let result = self
            .store_stream_locked(logical_name, version, src, size_hint, compressed, hint)
            .await;
        let _ = link_lock.unlock();
        result
    }

    async fn store_stream_locked<R>(
        &self,
        logical_name: &str,
        version: i64,
        src: R,
        size_hint: u64,
        compressed: bool,
        hint: Option<(Digest, u64)>,
    ) -> Result<StoreOutcome, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        if let Some(outcome) = self.existing_if_newer(logical_name, version)? {
            return Ok(outcome);
        }

        let temp = self.blobs.stage_async(src, size_hint).await?;
        self.finish_store(logical_name, version, temp, compressed, hint)
            .await
    }

    /// Returns the already-stored outcome for `logical_name` if its recorded
    /// version is newer than `version` (invariant 6's store-is-a-no-op case),
    /// without ever materializing `src`.
    fn existing_if_newer(&self, logical_name: &str, version: i64) -> Result<Option<StoreOutcome>, Error> {
        let Ok(existing) = self.links.stat(logical_name) else {
            return Ok(None);
        };
        if existing.version <= version {
            return Ok(None);
        }
        let record = self.metadata.get(&existing.digest)?.ok_or_else(|| {
            filetracker_error::make_err!(
                filetracker_error::Code::InternalInconsistency,
                "Link {logical_name} points at untracked digest {}",
                existing.digest
            )
        })?;
        Ok(Some(StoreOutcome {
            digest: existing.digest,
            logical_size: record.logical_size,
            version: existing.version,
        }))
    }

    /// Shared tail of both staging paths: hash (unless the caller already
    /// knows the digest), materialize the blob, and repoint the link.
    async fn finish_store(
        &self,
        logical_name: &str,
        version: i64,
        temp: tempfile::NamedTempFile,
        compressed: bool,
        hint: Option<(Digest, u64)>,
    ) -> Result<StoreOutcome, Error> {
        let (digest, logical_size) = match hint {
            Some((digest, logical_size)) => (digest, logical_size),
            None => BlobStore::hash_and_size(temp.path(), compressed)?,
        };

        self.materialize(&digest, logical_size, temp, compressed)
            .await?;
        self.replace_link(logical_name, &digest, version).await?;

        Ok(StoreOutcome {
            digest,
            logical_size,
            version,
        })
    }

    /// Resolves `logical_name` to its current digest and version.
    pub fn stat(&self, logical_name: &str) -> Result<LinkEntry, Error> {
        name::validate(logical_name, false)?;
        self.links.stat(logical_name)
    }

    /// The logical (decompressed) size of whatever `logical_name` currently
    /// points at.
    pub fn logical_size(&self, logical_name: &str) -> Result<u64, Error> {
        let entry = self.stat(logical_name)?;
        let record = self.metadata.get(&entry.digest)?.ok_or_else(|| {
            filetracker_error::make_err!(
                filetracker_error::Code::InternalInconsistency,
                "Link {logical_name} points at untracked digest {}",
                entry.digest
            )
        })?;
        Ok(record.logical_size)
    }

    /// Opens the (gzip-compressed) bytes backing `logical_name`.
    pub fn open(&self, logical_name: &str) -> Result<std::fs::File, Error> {
        let entry = self.stat(logical_name)?;
        self.blobs.open(&entry.digest)
    }

    /// Removes the link for `logical_name` at `version` and releases its
    /// reference on the underlying blob, deleting the blob outright if this
    /// was the last reference.
    ///
    /// Per invariant 7: `NotFound` if the name doesn't exist at all; `false`
    /// (no-op) if the stored version is newer than `version`; otherwise the
    /// link is removed and `true` is returned.
    pub async fn delete(&self, logical_name: &str, version: i64) -> Result<bool, Error> {
        name::validate(logical_name, false)?;

        let link_lock = self.locks.create_lock(&format!("links{logical_name}"))?;
        link_lock.lock_exclusive(self.retry).await?;
        let result = self.delete_locked(logical_name, version).await;
        let _ = link_lock.unlock();
        result
    }

    async fn delete_locked(&self, logical_name: &str, version: i64) -> Result<bool, Error> {
        let entry = self.links.stat(logical_name)?;
        if entry.version > version {
            return Ok(false);
        }
        self.links.remove(logical_name)?;
        self.release(&entry.digest).await?;
        Ok(true)
    }

    /// Lists every link under `prefix`, raw on-disk relative paths.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.links.list(prefix)
    }

    /// Like `list`, paired with each link's version (its mtime), so a caller
    /// filtering by a cutoff doesn't need a second pass over the tree.
    pub fn list_with_mtime(&self, prefix: &str) -> Result<Vec<(String, i64)>, Error> {
        self.links.list_with_mtime(prefix)
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Bumps `digest`'s refcount, materializing its blob the first time it's
    /// seen. Cheap (no-op materialize) on every subsequent store of the same
    /// content -- this is where de-duplication happens.
    async fn materialize(
        &self,
        digest: &Digest,
        logical_size: u64,
        temp: tempfile::NamedTempFile,
        compressed: bool,
    ) -> Result<(), Error> {
        let digest_lock = self.locks.create_lock(&format!("blobs/{}", digest.as_str()))?;
        digest_lock.lock_exclusive(self.retry).await?;
        let result = (move || -> Result<(), Error> {
            let previous = self.metadata.incref(digest, logical_size)?;
            if previous == 0 {
                self.blobs.finalize_from_temp(digest, temp, compressed)?;
            }
            Ok(())
        })();
        let _ = digest_lock.unlock();
        result
    }

    /// Releases one reference on `digest`, removing its blob if the count
    /// drops to zero. Called with the link lock already released, so the
    /// digest lock here never nests under a held link lock (matching the
    /// link-then-digest ordering used by `store`).
    async fn release(&self, digest: &Digest) -> Result<(), Error> {
        let digest_lock = self.locks.create_lock(&format!("blobs/{}", digest.as_str()))?;
        digest_lock.lock_exclusive(self.retry).await?;
        let result = (|| -> Result<(), Error> {
            let remaining = self.metadata.decref(digest)?;
            if remaining == 0 {
                self.blobs.remove(digest)?;
            }
            Ok(())
        })();
        let _ = digest_lock.unlock();
        result
    }

    /// Points `logical_name`'s link at `digest`/`version`, releasing the
    /// reference on whatever digest it previously pointed at (if any, and if
    /// different). Called with the name's link lock already held.
    async fn replace_link(&self, logical_name: &str, digest: &Digest, version: i64) -> Result<(), Error> {
        let previous = self.links.stat(logical_name).ok();
        self.links.put(logical_name, digest, version)?;
        if let Some(previous) = previous {
            if previous.digest != *digest {
                self.release(&previous.digest).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetracker_config::LockRetryConfig;
    use tempfile::tempdir;

    fn retry() -> LockRetryConfig {
        LockRetryConfig {
            attempts: 5,
            delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn store_then_stat_then_open_round_trips_content() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let payload = b"version one contents";

        let outcome = engine
            .store("/a/b", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();
        assert_eq!(outcome.logical_size, payload.len() as u64);

        let entry = engine.stat("/a/b").unwrap();
        assert_eq!(entry.digest, outcome.digest);
        assert_eq!(entry.version, 1);
        assert_eq!(engine.logical_size("/a/b").unwrap(), payload.len() as u64);
    }

    #[tokio::test]
    async fn storing_identical_content_twice_deduplicates_and_keeps_refcount() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let payload = b"shared bytes";

        let first = engine
            .store("/a", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();
        let second = engine
            .store("/b", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();
        assert_eq!(first.digest, second.digest);

        let record = engine.metadata().get(&first.digest).unwrap().unwrap();
        assert_eq!(record.refcount, 2);
    }

    #[tokio::test]
    async fn overwriting_a_name_releases_the_old_digest() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();

        let first = engine
            .store("/a", 1, &b"one"[..], 3, false, None)
            .await
            .unwrap();
        engine
            .store("/a", 2, &b"two"[..], 3, false, None)
            .await
            .unwrap();

        assert!(engine.metadata().get(&first.digest).unwrap().is_none());
        let entry = engine.stat("/a").unwrap();
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn delete_removes_link_and_last_reference_removes_blob() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let outcome = engine
            .store("/a", 1, &b"payload"[..], 7, false, None)
            .await
            .unwrap();

        let deleted = engine.delete("/a", 1).await.unwrap();

        assert!(deleted);
        assert!(engine.stat("/a").is_err());
        assert!(engine.metadata().get(&outcome.digest).unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_a_missing_name_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let err = engine.delete("/never/existed", 1).await.unwrap_err();
        assert_eq!(err.code, filetracker_error::Code::NotFound);
    }

    #[tokio::test]
    async fn delete_with_stale_version_is_a_noop_returning_false() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        engine.store("/a", 5, &b"payload"[..], 7, false, None).await.unwrap();

        let deleted = engine.delete("/a", 4).await.unwrap();

        assert!(!deleted);
        assert!(engine.stat("/a").is_ok());
    }

    #[tokio::test]
    async fn store_with_older_version_than_stored_is_a_noop() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let first = engine.store("/a", 5, &b"v5"[..], 2, false, None).await.unwrap();

        let second = engine.store("/a", 4, &b"stale"[..], 5, false, None).await.unwrap();

        assert_eq!(second.version, 5);
        assert_eq!(second.digest, first.digest);
        let entry = engine.stat("/a").unwrap();
        assert_eq!(entry.version, 5);
        assert_eq!(entry.digest, first.digest);
    }

    #[tokio::test]
    async fn store_with_equal_version_overwrites() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        engine.store("/a", 5, &b"first"[..], 5, false, None).await.unwrap();

        let second = engine.store("/a", 5, &b"secnd"[..], 5, false, None).await.unwrap();

        let entry = engine.stat("/a").unwrap();
        assert_eq!(entry.digest, second.digest);
    }

    #[tokio::test]
    async fn deleting_one_of_two_names_sharing_a_digest_keeps_the_blob() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let payload = b"shared";
        let outcome = engine
            .store("/a", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();
        engine
            .store("/b", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();

        engine.delete("/a", 1).await.unwrap();

        assert!(engine.stat("/b").is_ok());
        let record = engine.metadata().get(&outcome.digest).unwrap().unwrap();
        assert_eq!(record.refcount, 1);
    }

    #[tokio::test]
    async fn store_stream_round_trips_content_like_store() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let payload = b"streamed contents";

        let outcome = engine
            .store_stream("/a/b", 1, &payload[..], payload.len() as u64, false, None)
            .await
            .unwrap();
        assert_eq!(outcome.logical_size, payload.len() as u64);

        let entry = engine.stat("/a/b").unwrap();
        assert_eq!(entry.digest, outcome.digest);
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn store_stream_with_older_version_than_stored_is_a_noop() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        let first = engine.store("/a", 5, &b"v5"[..], 2, false, None).await.unwrap();

        let second = engine
            .store_stream("/a", 4, &b"stale"[..], 5, false, None)
            .await
            .unwrap();

        assert_eq!(second.version, 5);
        assert_eq!(second.digest, first.digest);
    }

    #[tokio::test]
    async fn list_reflects_stored_names() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        engine.store("/a/one", 1, &b"x"[..], 1, false, None).await.unwrap();
        engine.store("/a/two", 1, &b"y"[..], 1, false, None).await.unwrap();
        let mut names = engine.list("a").unwrap();
        names.sort();
        assert_eq!(names, vec!["a/one".to_string(), "a/two".to_string()]);
    }

    #[tokio::test]
    async fn list_with_mtime_carries_each_names_version() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), retry()).unwrap();
        engine.store("/a/one", 100, &b"x"[..], 1, false, None).await.unwrap();
        engine.store("/a/two", 200, &b"y"[..], 1, false, None).await.unwrap();
        let mut entries = engine.list_with_mtime("a").unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![("a/one".to_string(), 100), ("a/two".to_string(), 200)]
        );
    }
}
