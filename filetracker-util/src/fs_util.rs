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

//! Small filesystem helpers shared by the storage engine and the local
//! (cache) store.

use std::io::{Read, Write};
use std::path::Path;

use filetracker_error::{Error, ResultExt};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copies bytes from `src` to `dest`. If `size_hint` is non-zero, copies
/// exactly that many bytes (some request-body readers never signal EOF);
/// otherwise copies until EOF. Mirrors the reference implementation's
/// `_copy_stream`, which exists because certain WSGI input streams block
/// forever on a final `read()` past a declared `Content-Length`.
pub fn copy_with_size_hint<R: Read, W: Write>(
    mut src: R,
    mut dest: W,
    size_hint: u64,
) -> Result<u64, Error> {
    if size_hint == 0 {
        return std::io::copy(&mut src, &mut dest).err_tip(|| "Failed to copy stream to EOF");
    }
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = size_hint;
    while remaining > 0 {
        let want = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
        let read = src
            .read(&mut buf[..want])
            .err_tip(|| "Failed to read from source stream")?;
        if read == 0 {
            break;
        }
        dest.write_all(&buf[..read])
            .err_tip(|| "Failed to write to destination stream")?;
        remaining -= read as u64;
    }
    Ok(size_hint - remaining)
}

/// Creates the parent directory tree of `path`, if it doesn't already exist.
pub fn create_parent_dirs(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .err_tip(|| format!("Failed to create directory tree for {}", parent.display()))?;
    }
    Ok(())
}

/// Removes empty directories starting at `dir` and walking upward, stopping
/// at (and never removing) `stop_at`. Used after a link or lock file is
/// deleted to keep the tree from accumulating empty directories.
pub fn prune_empty_dirs(dir: &Path, stop_at: &Path) -> Result<(), Error> {
    let mut current = dir.to_path_buf();
    while current != stop_at && current.starts_with(stop_at) {
        match std::fs::remove_dir(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // Directory not empty (or some other transient condition):
            // stop climbing, this is not an error.
            Err(_) => break,
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}

/// Hardlinks `src` to `dest`, falling back to a full copy if the hardlink
/// fails (e.g. `src` and `dest` are on different filesystems).
pub fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<(), Error> {
    create_parent_dirs(dest)?;
    if dest.exists() {
        std::fs::remove_file(dest).err_tip(|| format!("Failed to remove {}", dest.display()))?;
    }
    if std::fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)
        .err_tip(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}
