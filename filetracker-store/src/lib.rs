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

//! The on-disk storage engine: content-addressed blobs, a symlink tree
//! mirroring the logical namespace, a transactional metadata KV, and the
//! cooperative file locking that keeps concurrent writers safe.

pub mod blob_store;
pub mod engine;
pub mod link_tree;
pub mod local_store;
pub mod lock_manager;
pub mod metadata;
pub mod recovery;

pub use blob_store::BlobStore;
pub use engine::{StorageEngine, StoreOutcome};
pub use link_tree::{LinkEntry, LinkTree};
pub use local_store::{CacheEntry, FileInfoEntry, LocalStore};
pub use lock_manager::{FileLock, LockManager};
pub use metadata::{DigestRecord, MetadataStore};
pub use recovery::{recover, RecoveryReport};
