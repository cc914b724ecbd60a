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

//! Content-addressed storage for blobs, kept gzip-compressed on disk and
//! bucketed into `<prefix>/<digest>` directories.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use filetracker_error::{Error, ResultExt};
use filetracker_util::digest::DigestHasher;
use filetracker_util::fs_util;
use filetracker_util::Digest;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

/// Content-addressed blob storage rooted at `<root>/blobs/<prefix>/<digest>`,
/// with a same-filesystem `<root>/tmp/` staging area so finalizing a blob is
/// a single atomic rename.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs"))
            .err_tip(|| format!("Failed to create {}", root.join("blobs").display()))?;
        std::fs::create_dir_all(root.join("tmp"))
            .err_tip(|| format!("Failed to create {}", root.join("tmp").display()))?;
        Ok(BlobStore { root })
    }

    /// Path of the (gzip-compressed) blob for `digest`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.prefix())
            .join(digest.as_str())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Creates a fresh staging file in `<root>/tmp/` and copies `size_hint`
    /// bytes (or until EOF if zero) of `src` into it verbatim. The caller
    /// decides afterward, via [`BlobStore::finalize_from_temp`], whether the
    /// staged bytes are raw or already gzip-compressed.
    pub fn stage<R: Read>(&self, src: R, size_hint: u64) -> Result<NamedTempFile, Error> {
        let temp = NamedTempFile::new_in(self.root.join("tmp"))
            .err_tip(|| "Failed to create staging file".to_string())?;
        let written = {
            let file = temp.as_file();
            fs_util::copy_with_size_hint(src, file, size_hint)?
        };
        if size_hint != 0 && written != size_hint {
            return Err(filetracker_error::make_err!(
                filetracker_error::Code::Internal,
                "Expected {} bytes but only received {}",
                size_hint,
                written
            ));
        }
        Ok(temp)
    }

    /// Like [`BlobStore::stage`] but copies from an async source via
    /// `tokio::io::copy`, so a caller streaming a request body never has to
    /// buffer the whole file in memory first.
    pub async fn stage_async<R>(&self, mut src: R, size_hint: u64) -> Result<NamedTempFile, Error>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let temp = NamedTempFile::new_in(self.root.join("tmp"))
            .err_tip(|| "Failed to create staging file".to_string())?;
        let written = {
            let std_file = temp
                .reopen()
                .err_tip(|| format!("Failed to reopen staging file {}", temp.path().display()))?;
            let mut file = tokio::fs::File::from_std(std_file);
            tokio::io::copy(&mut src, &mut file)
                .await
                .err_tip(|| "Failed to stream request body to staging file".to_string())?
        };
        if size_hint != 0 && written != size_hint {
            return Err(filetracker_error::make_err!(
                filetracker_error::Code::Internal,
                "Expected {} bytes but only received {}",
                size_hint,
                written
            ));
        }
        Ok(temp)
    }

    /// Computes the digest and logical (decompressed) size of a staged file.
    /// If `compressed` is true the file holds gzip bytes and must be
    /// decompressed while hashing; otherwise it holds raw bytes.
    pub fn hash_and_size(path: &Path, compressed: bool) -> Result<(Digest, u64), Error> {
        let file = File::open(path).err_tip(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut hasher = DigestHasher::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size: u64 = 0;

        if compressed {
            let mut decoder = GzDecoder::new(&mut reader);
            loop {
                let read = decoder
                    .read(&mut buf)
                    .err_tip(|| "Failed to decompress staged blob".to_string())?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                size += read as u64;
            }
        } else {
            loop {
                let read = reader
                    .read(&mut buf)
                    .err_tip(|| "Failed to read staged blob".to_string())?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                size += read as u64;
            }
        }
        Ok((hasher.finalize(), size))
    }

    /// Moves a staged file into place as `digest`'s blob. If `compressed` is
    /// false the staged bytes are raw and get gzip-compressed on the way in;
    /// if true they're already gzip bytes and are persisted verbatim.
    ///
    /// A no-op (the temp file is simply dropped) if the blob already exists,
    /// since the caller is expected to have already bumped its refcount.
    pub fn finalize_from_temp(
        &self,
        digest: &Digest,
        temp: NamedTempFile,
        compressed: bool,
    ) -> Result<(), Error> {
        let dest = self.blob_path(digest);
        if dest.is_file() {
            return Ok(());
        }
        fs_util::create_parent_dirs(&dest)?;

        if compressed {
            temp.persist(&dest)
                .map_err(|e| e.error)
                .err_tip(|| format!("Failed to persist blob to {}", dest.display()))?;
            return Ok(());
        }

        let compressed_temp = NamedTempFile::new_in(self.root.join("tmp"))
            .err_tip(|| "Failed to create compression staging file".to_string())?;
        {
            let src = File::open(temp.path())
                .err_tip(|| format!("Failed to reopen staged blob {}", temp.path().display()))?;
            let mut reader = BufReader::new(src);
            let mut encoder =
                GzEncoder::new(BufWriter::new(compressed_temp.as_file()), Compression::default());
            std::io::copy(&mut reader, &mut encoder)
                .err_tip(|| "Failed to gzip-compress staged blob".to_string())?;
            let mut writer = encoder
                .finish()
                .err_tip(|| "Failed to finish gzip stream".to_string())?;
            writer
                .flush()
                .err_tip(|| "Failed to flush compressed blob".to_string())?;
        }
        compressed_temp
            .persist(&dest)
            .map_err(|e| e.error)
            .err_tip(|| format!("Failed to persist blob to {}", dest.display()))?;
        Ok(())
    }

    /// Opens the (gzip-compressed) bytes of `digest` for streaming to a
    /// caller that wants the compressed representation verbatim.
    pub fn open(&self, digest: &Digest) -> Result<File, Error> {
        let path = self.blob_path(digest);
        File::open(&path).err_tip(|| format!("Failed to open blob {}", path.display()))
    }

    /// Removes a blob. Idempotent: a missing blob is not an error.
    pub fn remove(&self, digest: &Digest) -> Result<(), Error> {
        let path = self.blob_path(digest);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).err_tip(|| format!("Failed to remove blob {}", path.display())),
        }
        fs_util::prune_empty_dirs(path.parent().unwrap(), &self.root.join("blobs"))
    }
}
