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

//! The blob identity: hex SHA-256 of decompressed content.

use std::fmt;

use filetracker_error::{make_err, Code, Error};
use sha2::{Digest as _, Sha256};

/// A 64-character lowercase hex SHA-256 digest, identifying a blob by the
/// hash of its *decompressed* content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parses an existing hex digest string, validating its shape.
    pub fn parse(hash: &str) -> Result<Self, Error> {
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(make_err!(
                Code::InvalidName,
                "Invalid SHA256 digest: {hash:?}"
            ));
        }
        Ok(Digest(hash.to_ascii_lowercase()))
    }

    /// The two-hex-character directory prefix used to bucket blobs.
    pub fn prefix(&self) -> &str {
        &self.0[0..2]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementally hashes chunks of decompressed content into a [`Digest`].
#[derive(Default)]
pub struct DigestHasher(Sha256);

impl DigestHasher {
    pub fn new() -> Self {
        DigestHasher(Sha256::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        Digest(hex::encode(self.0.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_vector() {
        let mut hasher = DigestHasher::new();
        hasher.update(b"hello");
        let digest = hasher.finalize();
        assert_eq!(
            digest.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn prefix_is_first_two_chars() {
        let digest = Digest::parse(
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
        assert_eq!(digest.prefix(), "2c");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(Digest::parse("abc").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert!(Digest::parse(&"z".repeat(64)).is_err());
    }
}
