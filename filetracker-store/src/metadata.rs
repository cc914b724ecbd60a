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

//! The metadata key-value store: per-digest refcount and logical size, kept
//! transactionally consistent in a single `sled::Db`.

use std::path::Path;

use filetracker_error::{make_err, Code, Error, ResultExt};
use filetracker_util::Digest;
use sled::transaction::{ConflictableTransactionError, TransactionError};

/// Refcount and logical (decompressed) size recorded for one digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestRecord {
    pub refcount: u64,
    pub logical_size: u64,
}

/// A `sled::Db`-backed store of `DigestRecord`s, keyed by digest hex string.
/// One tree (`"refs"`) holds the refcount, another (`"sizes"`) the logical
/// size; both are updated together inside a `sled` transaction so a crash
/// never leaves one without the other.
pub struct MetadataStore {
    refs: sled::Tree,
    sizes: sled::Tree,
}

impl MetadataStore {
    pub fn open(db_path: &Path) -> Result<Self, Error> {
        let db = sled::open(db_path)
            .err_tip(|| format!("Failed to open metadata db at {}", db_path.display()))?;
        let refs = db
            .open_tree("refs")
            .err_tip(|| "Failed to open refs tree".to_string())?;
        let sizes = db
            .open_tree("sizes")
            .err_tip(|| "Failed to open sizes tree".to_string())?;
        Ok(MetadataStore { refs, sizes })
    }

    /// Looks up the current record for `digest`, if any.
    pub fn get(&self, digest: &Digest) -> Result<Option<DigestRecord>, Error> {
        let refcount = self
            .refs
            .get(digest.as_str())
            .err_tip(|| "Failed to read refcount".to_string())?;
        let Some(refcount) = refcount else {
            return Ok(None);
        };
        let logical_size = self
            .sizes
            .get(digest.as_str())
            .err_tip(|| "Failed to read logical size".to_string())?
            .map(|bytes| decode_u64(&bytes))
            .transpose()?
            .unwrap_or(0);
        Ok(Some(DigestRecord {
            refcount: decode_u64(&refcount)?,
            logical_size,
        }))
    }

    /// Increments `digest`'s refcount, initializing `logical_size` the first
    /// time the digest is seen. Returns the refcount *before* this
    /// increment, so the caller can tell whether the blob already existed.
    pub fn incref(&self, digest: &Digest, logical_size: u64) -> Result<u64, Error> {
        let key = digest.as_str().as_bytes();
        let result = (&self.refs, &self.sizes).transaction(|(refs, sizes)| {
            let previous = refs
                .get(key)?
                .map(|bytes| decode_u64(&bytes).map_err(abort))
                .transpose()?
                .unwrap_or(0);
            refs.insert(key, &encode_u64(previous + 1))?;
            if previous == 0 {
                sizes.insert(key, &encode_u64(logical_size))?;
            }
            Ok(previous)
        });
        result.map_err(transaction_err)
    }

    /// Decrements `digest`'s refcount, removing its record entirely once it
    /// reaches zero. Returns the refcount *after* this decrement; `0` means
    /// the caller is now responsible for removing the underlying blob.
    /// A no-op (`0`) if the digest is not tracked at all.
    pub fn decref(&self, digest: &Digest) -> Result<u64, Error> {
        let key = digest.as_str().as_bytes();
        let result = (&self.refs, &self.sizes).transaction(|(refs, sizes)| {
            let previous = refs
                .get(key)?
                .map(|bytes| decode_u64(&bytes).map_err(abort))
                .transpose()?
                .unwrap_or(0);
            if previous == 0 {
                return Ok(0);
            }
            let next = previous - 1;
            if next == 0 {
                refs.remove(key)?;
                sizes.remove(key)?;
            } else {
                refs.insert(key, &encode_u64(next))?;
            }
            Ok(next)
        });
        result.map_err(transaction_err)
    }

    /// Overwrites `digest`'s record wholesale, used only by `recover()` to
    /// rebuild the KV from a filesystem scan.
    pub fn set(&self, digest: &Digest, record: DigestRecord) -> Result<(), Error> {
        let key = digest.as_str().as_bytes();
        let result = (&self.refs, &self.sizes).transaction(|(refs, sizes)| {
            refs.insert(key, &encode_u64(record.refcount))?;
            sizes.insert(key, &encode_u64(record.logical_size))?;
            Ok(())
        });
        result.map_err(transaction_err)
    }

    /// Removes `digest`'s record entirely, used by `recover()` to drop
    /// entries for blobs that no longer have any incoming link.
    pub fn remove(&self, digest: &Digest) -> Result<(), Error> {
        let key = digest.as_str().as_bytes();
        let result = (&self.refs, &self.sizes).transaction(|(refs, sizes)| {
            refs.remove(key)?;
            sizes.remove(key)?;
            Ok(())
        });
        result.map_err(transaction_err)
    }

    /// Iterates every tracked digest and its record, for `recover()`.
    pub fn iter(&self) -> Result<Vec<(Digest, DigestRecord)>, Error> {
        let mut out = Vec::new();
        for entry in self.refs.iter() {
            let (key, value) = entry.err_tip(|| "Failed to iterate refs tree".to_string())?;
            let digest_str = std::str::from_utf8(&key)
                .map_err(|_| make_err!(Code::InternalInconsistency, "Non-UTF8 digest key in metadata db"))?;
            let digest = Digest::parse(digest_str)
                .err_tip(|| "Malformed digest key in metadata db".to_string())?;
            let refcount = decode_u64(&value)?;
            let logical_size = self
                .sizes
                .get(&key)
                .err_tip(|| "Failed to read logical size".to_string())?
                .map(|bytes| decode_u64(&bytes))
                .transpose()?
                .unwrap_or(0);
            out.push((
                digest,
                DigestRecord {
                    refcount,
                    logical_size,
                },
            ));
        }
        Ok(out)
    }
}

fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

fn decode_u64(bytes: &[u8]) -> Result<u64, Error> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| make_err!(Code::InternalInconsistency, "Corrupt 8-byte counter in metadata db"))?;
    Ok(u64::from_be_bytes(array))
}

fn abort(e: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e)
}

fn transaction_err(e: TransactionError<Error>) -> Error {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => {
            make_err!(Code::InternalInconsistency, "Metadata transaction failed: {inner}")
        }
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
    fn incref_new_digest_starts_refcount_at_one() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("db")).unwrap();
        let previous = store.incref(&digest('a'), 42).unwrap();
        assert_eq!(previous, 0);
        let record = store.get(&digest('a')).unwrap().unwrap();
        assert_eq!(record.refcount, 1);
        assert_eq!(record.logical_size, 42);
    }

    #[test]
    fn incref_existing_digest_preserves_logical_size() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("db")).unwrap();
        store.incref(&digest('a'), 42).unwrap();
        let previous = store.incref(&digest('a'), 999).unwrap();
        assert_eq!(previous, 1);
        let record = store.get(&digest('a')).unwrap().unwrap();
        assert_eq!(record.refcount, 2);
        assert_eq!(record.logical_size, 42);
    }

    #[test]
    fn decref_to_zero_removes_the_record() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("db")).unwrap();
        store.incref(&digest('a'), 10).unwrap();
        let remaining = store.decref(&digest('a')).unwrap();
        assert_eq!(remaining, 0);
        assert!(store.get(&digest('a')).unwrap().is_none());
    }

    #[test]
    fn decref_untracked_digest_is_a_harmless_noop() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("db")).unwrap();
        assert_eq!(store.decref(&digest('z')).unwrap(), 0);
    }

    #[test]
    fn iter_lists_every_tracked_digest() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("db")).unwrap();
        store.incref(&digest('a'), 1).unwrap();
        store.incref(&digest('b'), 2).unwrap();
        let mut all = store.iter().unwrap();
        all.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        assert_eq!(all.len(), 2);
    }
}
