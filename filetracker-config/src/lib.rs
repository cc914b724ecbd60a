// Copyright 2022 The Turbo Cache Authors. All rights reserved.
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

pub mod serde_utils;

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_optional_string_with_shellexpand, convert_string_with_shellexpand,
};

/// The number of attempts a lock acquisition makes before giving up with
/// `ConcurrentModification`.
fn default_lock_retry_attempts() -> u32 {
    20
}

/// The delay between lock acquisition attempts, in milliseconds.
fn default_lock_retry_delay_ms() -> u64 {
    1000
}

/// Cooperative lock retry policy, shared by the server's storage engine and
/// the client's cache `LockManager`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryConfig {
    #[serde(default = "default_lock_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        LockRetryConfig {
            attempts: default_lock_retry_attempts(),
            delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    7000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration for the `filetracker-server` binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding `blobs/`, `links/`, `locks/` and `db/`.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub data_dir: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Base URL of a legacy backend to fall back to on GET misses. When
    /// set, the server runs as a migration shim instead of a primary.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub fallback_url: Option<String>,

    #[serde(default)]
    pub lock_retry: LockRetryConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cache_dir() -> String {
    "~/.filetracker-store".to_string()
}

/// Configuration for `filetracker-client` / `filetracker-cli`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClientConfig {
    /// Local cache directory. Overridable by the `FILETRACKER_DIR` env var.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub cache_dir: Option<String>,

    /// Remote server base URL. Overridable by the `FILETRACKER_URL` env var.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub remote_url: Option<String>,

    #[serde(default)]
    pub lock_retry: LockRetryConfig,
}

impl ClientConfig {
    /// Builds configuration from environment variables, falling back to the
    /// reference defaults (`~/.filetracker-store`, no remote).
    pub fn from_env() -> Self {
        ClientConfig {
            cache_dir: Some(
                std::env::var("FILETRACKER_DIR").unwrap_or_else(|_| default_cache_dir()),
            ),
            remote_url: std::env::var("FILETRACKER_URL").ok(),
            lock_retry: LockRetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_retry_defaults_match_reference() {
        let config = LockRetryConfig::default();
        assert_eq!(config.attempts, 20);
        assert_eq!(config.delay_ms, 1000);
    }

    #[test]
    fn server_config_parses_from_json5() {
        let config: ServerConfig = serde_json5::from_str(
            r#"{
                data_dir: "/tmp/filetracker",
                listen_port: 8080,
            }"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, "/tmp/filetracker");
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.listen_address, "0.0.0.0");
    }

    #[test]
    fn client_config_from_env_uses_defaults_when_unset() {
        std::env::remove_var("FILETRACKER_DIR");
        std::env::remove_var("FILETRACKER_URL");
        let config = ClientConfig::from_env();
        assert_eq!(config.cache_dir.as_deref(), Some("~/.filetracker-store"));
        assert_eq!(config.remote_url, None);
    }
}
