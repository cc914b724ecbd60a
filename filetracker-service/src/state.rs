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

use std::sync::Arc;

use filetracker_store::StorageEngine;

/// Shared state every handler closes over. Holds no mutable state of its
/// own beyond the storage engine, per the contract: the server is a plain
/// request dispatcher.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StorageEngine>,
    /// Base URL of a legacy backend. When set, GET misses on `/files` are
    /// redirected there instead of failing with 404.
    pub fallback_url: Option<String>,
}

impl AppState {
    pub fn new(engine: Arc<StorageEngine>, fallback_url: Option<String>) -> Self {
        AppState { engine, fallback_url }
    }
}
