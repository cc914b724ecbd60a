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

//! Top-level client: a `LocalStore` cache, a `RemoteStore`, and the
//! `LockManager` that keeps concurrent callers on one cache from racing.

use std::path::Path;

use filetracker_config::{ClientConfig, LockRetryConfig};
use filetracker_error::{make_err, make_input_err, Code, Error, ResultExt};
use filetracker_store::{FileLock, FileInfoEntry, LocalStore, LockManager};
use filetracker_util::name;

use crate::remote_store::RemoteStore;

pub struct Client {
    local: Option<LocalStore>,
    remote: Option<RemoteStore>,
    locks: Option<LockManager>,
    retry: LockRetryConfig,
}

impl Client {
    /// Builds a client from `config`. At least one of `cache_dir` /
    /// `remote_url` must be set.
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        if config.cache_dir.is_none() && config.remote_url.is_none() {
            return Err(make_err!(
                Code::Internal,
                "filetracker client requires at least one of cache_dir or remote_url"
            ));
        }
        let local = config.cache_dir.as_deref().map(LocalStore::new).transpose()?;
        let locks = match &config.cache_dir {
            Some(dir) => Some(LockManager::new(
                Path::new(dir).join("locks"),
                config.lock_retry,
            )?),
            None => None,
        };
        let remote = config.remote_url.as_deref().map(RemoteStore::new);
        Ok(Client {
            local,
            remote,
            locks,
            retry: config.lock_retry,
        })
    }

    /// Resolves `name` (possibly `"<base>@<version>"`) into `dest`,
    /// preferring the cache where that's sufficient to answer the request,
    /// and the remote otherwise. Returns the versioned name actually
    /// materialized.
    pub async fn get_file(&self, name: &str, dest: &Path, add_to_cache: bool, force_refresh: bool) -> Result<String, Error> {
        let (base, requested_version) = name::split(name)?;
        let lock = self.lock_for(&base, true).await?;
        let result = self
            .get_file_locked(&base, requested_version, dest, add_to_cache, force_refresh, lock.as_ref(), false)
            .await;
        if let Some(lock) = &lock {
            let _ = lock.unlock();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn get_file_locked(
        &self,
        base: &str,
        requested_version: Option<i64>,
        dest: &Path,
        add_to_cache: bool,
        force_refresh: bool,
        lock: Option<&FileLock>,
        already_exclusive: bool,
    ) -> Result<String, Error> {
        let cache_first = self.remote.is_none() || (requested_version.is_some() && !force_refresh);
        if cache_first {
            if let Some(local) = &self.local {
                if let Some(entry) = local.cached_version(base)? {
                    if requested_version.map_or(true, |v| v == entry.version) {
                        local.link_out(base, dest)?;
                        return Ok(name::join(base, entry.version));
                    }
                }
                if self.remote.is_none() {
                    return Err(make_err!(Code::NotFound, "{base} is not cached and no remote is configured"));
                }
            }
        }

        let remote = self
            .remote
            .as_ref()
            .expect("cache_first only short-circuits above when remote is absent");

        if add_to_cache && lock.is_some() && !already_exclusive {
            if let Some(lock) = lock {
                let _ = lock.unlock();
            }
            let locks = self.locks.as_ref().expect("a held lock implies a LockManager");
            let exclusive = locks.create_lock(&format!("links{base}"))?;
            exclusive.lock_exclusive(self.retry).await?;
            let result = self
                .get_file_locked(base, requested_version, dest, add_to_cache, force_refresh, Some(&exclusive), true)
                .await;
            let _ = exclusive.unlock();
            return result;
        }

        let entry = remote.get_to_path(base, dest).await?;
        if let Some(requested) = requested_version {
            if requested != entry.version {
                return Err(make_err!(
                    Code::NotFound,
                    "{base}@{requested} is not the currently stored version ({})",
                    entry.version
                ));
            }
        }
        if add_to_cache {
            if let Some(local) = &self.local {
                local.store_from_path(base, entry.version, dest)?;
            }
        }
        Ok(name::join(base, entry.version))
    }

    /// Streaming variant of [`Client::get_file`]. When `serve_from_cache` is
    /// set and both stores are configured, forces a cache insert first so
    /// the caller reads back a file-backed stream.
    pub async fn get_stream(&self, name: &str, force_refresh: bool, serve_from_cache: bool) -> Result<(String, tokio::fs::File), Error> {
        let add_to_cache = serve_from_cache && self.local.is_some() && self.remote.is_some();
        let temp = tempfile::NamedTempFile::new().err_tip(|| "Failed to create temp file for stream")?;
        let versioned = self.get_file(name, temp.path(), add_to_cache, force_refresh).await?;

        let source = if add_to_cache {
            let (base, _) = filetracker_util::name::split(name)?;
            self.local
                .as_ref()
                .expect("add_to_cache implies local is configured")
                .path(&base)
        } else {
            temp.path().to_path_buf()
        };
        let file = tokio::fs::File::open(&source)
            .await
            .err_tip(|| format!("Failed to open {}", source.display()))?;
        Ok((versioned, file))
    }

    /// Writes `source` under `name` (which must carry an explicit version)
    /// to whichever of the local/remote stores are requested and
    /// configured. The remote's reported version wins when both are
    /// written.
    pub async fn put_file(&self, name: &str, source: &Path, to_local: bool, to_remote: bool, compress_hint: bool) -> Result<String, Error> {
        let (base, requested_version) = name::split(name)?;
        let version = requested_version
            .ok_or_else(|| make_input_err!("put_file requires a versioned name, e.g. \"{base}@<version>\""))?;
        filetracker_util::name::validate(&base, false)?;

        let lock = self.lock_for(&base, false).await?;
        let result = self.put_file_locked(&base, version, source, to_local, to_remote, compress_hint).await;
        if let Some(lock) = &lock {
            let _ = lock.unlock();
        }
        result
    }

    async fn put_file_locked(
        &self,
        base: &str,
        version: i64,
        source: &Path,
        to_local: bool,
        to_remote: bool,
        compress_hint: bool,
    ) -> Result<String, Error> {
        let mut resulting = name::join(base, version);

        if to_local {
            if let Some(local) = &self.local {
                local.store_from_path(base, version, source)?;
                resulting = name::join(base, version);
            }
        }

        if to_remote {
            if let Some(remote) = &self.remote {
                let entry = remote.put(base, version, source, compress_hint).await?;
                resulting = name::join(base, entry.version);
            }
        }

        Ok(resulting)
    }

    /// The currently-stored version of `name`: remote if configured
    /// (assumed authoritative), otherwise whatever's cached.
    pub async fn file_version(&self, name: &str) -> Result<i64, Error> {
        let (base, _) = name::split(name)?;
        if let Some(remote) = &self.remote {
            return Ok(remote.stat(&base).await?.version);
        }
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "no store configured"))?;
        let entry = local
            .cached_version(&base)?
            .ok_or_else(|| make_err!(Code::NotFound, "{base} is not cached"))?;
        Ok(entry.version)
    }

    /// The logical (decompressed) size of `name`, following the same
    /// cache-first fallback rules as `get_file`. May be slightly stale: no
    /// lock is held while answering.
    pub async fn file_size(&self, name: &str, force_refresh: bool) -> Result<u64, Error> {
        let (base, requested_version) = name::split(name)?;
        let cache_first = self.remote.is_none() || (requested_version.is_some() && !force_refresh);
        if cache_first {
            if let Some(local) = &self.local {
                if let Some(entry) = local.cached_version(&base)? {
                    if requested_version.map_or(true, |v| v == entry.version) {
                        let path = local.path(&base);
                        let meta = std::fs::metadata(&path).err_tip(|| format!("Failed to stat {}", path.display()))?;
                        return Ok(meta.len());
                    }
                }
                if self.remote.is_none() {
                    return Err(make_err!(Code::NotFound, "{base} is not cached and no remote is configured"));
                }
            }
        }
        let remote = self
            .remote
            .as_ref()
            .expect("cache_first only short-circuits above when remote is absent");
        Ok(remote.stat(&base).await?.logical_size)
    }

    /// Deletes `name` from the cache, then (capability permitting) from the
    /// remote. The remote delete is silently skipped against a protocol-1
    /// server, which has no DELETE support.
    pub async fn delete_file(&self, name: &str) -> Result<(), Error> {
        let (base, requested_version) = name::split(name)?;
        let lock = self.lock_for(&base, false).await?;
        let result = self.delete_file_locked(&base, requested_version).await;
        if let Some(lock) = &lock {
            let _ = lock.unlock();
        }
        result
    }

    async fn delete_file_locked(&self, base: &str, requested_version: Option<i64>) -> Result<(), Error> {
        let version = match requested_version {
            Some(v) => v,
            None => self.file_version(base).await?,
        };
        if let Some(local) = &self.local {
            local.remove(base)?;
        }
        if let Some(remote) = &self.remote {
            if remote.protocol_version().await? >= 2 {
                remote.delete(base, version).await?;
            }
        }
        Ok(())
    }

    /// Every cached file, for a cache cleaner to decide what to evict.
    pub fn list_local_files(&self) -> Result<Vec<FileInfoEntry>, Error> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| make_err!(Code::Internal, "no local cache configured"))?;
        local.list()
    }

    async fn lock_for(&self, base: &str, shared: bool) -> Result<Option<FileLock>, Error> {
        let Some(locks) = &self.locks else {
            return Ok(None);
        };
        let lock = locks.create_lock(&format!("links{base}"))?;
        if shared {
            lock.lock_shared(self.retry).await?;
        } else {
            lock.lock_exclusive(self.retry).await?;
        }
        Ok(Some(lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(cache: &std::path::Path) -> ClientConfig {
        ClientConfig {
            cache_dir: Some(cache.to_string_lossy().into_owned()),
            remote_url: None,
            lock_retry: LockRetryConfig { attempts: 5, delay_ms: 5 },
        }
    }

    #[test]
    fn new_requires_at_least_one_store() {
        let config = ClientConfig {
            cache_dir: None,
            remote_url: None,
            lock_retry: LockRetryConfig::default(),
        };
        assert!(Client::new(&config).is_err());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_cache_only() {
        let cache_dir = tempdir().unwrap();
        let client = Client::new(&config(cache_dir.path())).unwrap();

        let src_dir = tempdir().unwrap();
        let source = src_dir.path().join("payload");
        std::fs::write(&source, b"hello cache").unwrap();

        let versioned = client.put_file("/a/b@42", &source, true, false, false).await.unwrap();
        assert_eq!(versioned, "/a/b@42");

        let out_dir = tempdir().unwrap();
        let dest = out_dir.path().join("out.txt");
        let resolved = client.get_file("/a/b", &dest, false, false).await.unwrap();
        assert_eq!(resolved, "/a/b@42");
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello cache");
    }

    #[tokio::test]
    async fn get_file_with_cache_only_and_no_entry_is_not_found() {
        let cache_dir = tempdir().unwrap();
        let client = Client::new(&config(cache_dir.path())).unwrap();
        let out_dir = tempdir().unwrap();
        let err = client
            .get_file("/missing", &out_dir.path().join("out"), false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn file_version_reads_from_cache_when_no_remote_is_configured() {
        let cache_dir = tempdir().unwrap();
        let client = Client::new(&config(cache_dir.path())).unwrap();
        let src_dir = tempdir().unwrap();
        let source = src_dir.path().join("payload");
        std::fs::write(&source, b"x").unwrap();
        client.put_file("/a@7", &source, true, false, false).await.unwrap();

        assert_eq!(client.file_version("/a").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn delete_file_removes_the_cached_entry() {
        let cache_dir = tempdir().unwrap();
        let client = Client::new(&config(cache_dir.path())).unwrap();
        let src_dir = tempdir().unwrap();
        let source = src_dir.path().join("payload");
        std::fs::write(&source, b"x").unwrap();
        client.put_file("/a@1", &source, true, false, false).await.unwrap();

        client.delete_file("/a@1").await.unwrap();

        assert!(client
            .get_file("/a", &src_dir.path().join("out"), false, false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_local_files_reports_every_cached_entry() {
        let cache_dir = tempdir().unwrap();
        let client = Client::new(&config(cache_dir.path())).unwrap();
        let src_dir = tempdir().unwrap();
        let source = src_dir.path().join("payload");
        std::fs::write(&source, b"x").unwrap();
        client.put_file("/a@1", &source, true, false, false).await.unwrap();
        client.put_file("/b@2", &source, true, false, false).await.unwrap();

        let mut entries = client.list_local_files().unwrap();
        entries.sort_by(|a, b| a.versioned_name.cmp(&b.versioned_name));
        assert_eq!(entries[0].versioned_name, "/a@1");
        assert_eq!(entries[1].versioned_name, "/b@2");
    }
}
