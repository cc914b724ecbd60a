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

//! Parses and validates the `"/path@version"` logical name grammar.

use filetracker_error::{make_input_err, Error};

/// Splits a (possibly versioned) name into its unversioned base and an
/// optional version. `"/a/b@5"` -> `("/a/b", Some(5))`; `"/a/b"` -> `("/a/b", None)`.
pub fn split(name: &str) -> Result<(String, Option<i64>), Error> {
    match name.rsplit_once('@') {
        None => Ok((name.to_string(), None)),
        Some((base, version_str)) => {
            let version = version_str
                .parse::<i64>()
                .map_err(|_| make_input_err!("Invalid filetracker name: version must be an integer, not {version_str:?}"))?;
            Ok((base.to_string(), Some(version)))
        }
    }
}

/// Joins an unversioned name with a version into its textual versioned form.
pub fn join(base: &str, version: i64) -> String {
    format!("{base}@{version}")
}

/// Validates a logical name per the grammar in the data model: absolute,
/// `..`-free, at most one `@` and only in the final path segment.
///
/// If `allow_version` is `false`, a name carrying a version is rejected --
/// some client entry points only accept unversioned names.
pub fn validate(name: &str, allow_version: bool) -> Result<(), Error> {
    if name.is_empty() {
        return Err(make_input_err!("Invalid filetracker name: empty name"));
    }
    if !name.starts_with('/') {
        return Err(make_input_err!(
            "Invalid filetracker name: {name:?} does not start with /"
        ));
    }
    let parts: Vec<&str> = name.split('/').collect();
    if parts.iter().any(|p| *p == "..") {
        return Err(make_input_err!("Invalid filetracker name: {name:?} contains .."));
    }
    let last = *parts.last().expect("split always yields at least one part");
    let leading_joined: String = parts[..parts.len() - 1].concat();
    if leading_joined.contains('@') {
        return Err(make_input_err!(
            "Invalid filetracker name: {name:?} has @ outside the final segment"
        ));
    }
    if last.split('@').count() > 2 {
        return Err(make_input_err!(
            "Invalid filetracker name: {name:?} has multiple versions"
        ));
    }
    if last.contains('@') && !allow_version {
        return Err(make_input_err!(
            "Invalid filetracker name: {name:?} carries a version where none is allowed"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_unversioned() {
        assert_eq!(split("/a/b").unwrap(), ("/a/b".to_string(), None));
    }

    #[test]
    fn split_versioned() {
        assert_eq!(split("/a/b@42").unwrap(), ("/a/b".to_string(), Some(42)));
    }

    #[test]
    fn split_rejects_non_integer_version() {
        assert!(split("/a/b@xyz").is_err());
    }

    #[test]
    fn join_round_trips() {
        let joined = join("/a/b", 42);
        assert_eq!(joined, "/a/b@42");
        assert_eq!(split(&joined).unwrap(), ("/a/b".to_string(), Some(42)));
    }

    #[test]
    fn validate_requires_leading_slash() {
        assert!(validate("a/b", true).is_err());
    }

    #[test]
    fn validate_rejects_dotdot() {
        assert!(validate("/a/../b", true).is_err());
    }

    #[test]
    fn validate_rejects_at_outside_final_segment() {
        assert!(validate("/a@1/b", true).is_err());
    }

    #[test]
    fn validate_rejects_multiple_versions_in_final_segment() {
        assert!(validate("/a/b@1@2", true).is_err());
    }

    #[test]
    fn validate_allows_single_version_in_final_segment() {
        assert!(validate("/a/b@1", true).is_ok());
    }

    #[test]
    fn validate_rejects_version_when_disallowed() {
        assert!(validate("/a/b@1", false).is_err());
    }
}
