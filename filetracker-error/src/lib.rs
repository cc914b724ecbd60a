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

//! Shared error vocabulary for every filetracker crate.
//!
//! Mirrors the abstract error kinds in the storage-engine contract: each
//! kind maps to exactly one HTTP status and one wire behavior, so the engine
//! never has to know about HTTP and the HTTP layer never has to know about
//! the storage internals.

use std::fmt;

/// Abstract error kind. See the error handling design for the full mapping
/// of each kind to its HTTP status and propagation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// A name failed `filetracker_util::name::validate`. HTTP: 400.
    InvalidName,
    /// A link or logical file does not exist. HTTP: 404.
    NotFound,
    /// Caller specified a version that does not match what's stored.
    /// Treated as `NotFound` on the wire for reads; no-op for writes.
    VersionMismatch,
    /// Lock acquisition exhausted its retry budget. HTTP: 503.
    ConcurrentModification,
    /// The metadata KV and the filesystem disagree. HTTP: 500, expected to
    /// be repaired by `filetracker_store::recovery::recover`.
    InternalInconsistency,
    /// An HTTP/networking failure observed by the client.
    TransportError,
    /// The client and server share no protocol version.
    ProtocolNegotiationError,
    /// Anything that doesn't fit one of the above.
    Internal,
}

impl Code {
    /// The HTTP status code this kind maps to when surfaced by the server.
    pub fn http_status(self) -> u16 {
        match self {
            Code::InvalidName => 400,
            Code::NotFound | Code::VersionMismatch => 404,
            Code::ConcurrentModification => 503,
            Code::InternalInconsistency | Code::Internal => 500,
            Code::TransportError => 502,
            Code::ProtocolNegotiationError => 426,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An error carrying an abstract [`Code`] plus a breadcrumb trail of context
/// messages, innermost-first. [`ResultExt::err_tip`] appends to the trail
/// without discarding the original code.
#[derive(Clone, PartialEq, Eq)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, message: String) -> Self {
        Error {
            code,
            messages: vec![message],
        }
    }

    /// Appends a context message produced lazily, used by `err_tip`.
    pub fn append(mut self, message: String) -> Self {
        self.messages.push(message);
        self
    }

    /// The most specific (innermost) message, suitable for a short
    /// `X-Exception` header value.
    pub fn last_message(&self) -> &str {
        self.messages
            .first()
            .map(String::as_str)
            .unwrap_or("unknown error")
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {{ code: {:?}, messages: {:?} }}", self.code, self.messages)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.messages.join(" :: "))
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => Code::NotFound,
            _ => Code::Internal,
        };
        Error::new(code, format!("IO error: {e}"))
    }
}

/// Extension trait that lets any `Result<T, E: Into<Error>>` attach a lazy
/// context message on failure, the same way `nativelink_error::ResultExt`
/// lets the teacher's code tag errors as they propagate up the stack.
pub trait ResultExt<T> {
    fn err_tip<F, M>(self, tip_fn: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip<F, M>(self, tip_fn: F) -> Result<T, Error>
    where
        F: FnOnce() -> M,
        M: Into<String>,
    {
        self.map_err(|e| e.into().append(tip_fn().into()))
    }
}

/// Merges two results, preferring the first error but appending the
/// second's messages if both failed. Used when two independent operations
/// ran concurrently (e.g. a `join!` of two stores) and both need to be
/// reported.
pub trait ErrorMerge<T> {
    fn merge(self, other: Result<T, Error>) -> Result<T, Error>;
}

impl<T> ErrorMerge<T> for Result<T, Error> {
    fn merge(self, other: Result<T, Error>) -> Result<T, Error> {
        match (self, other) {
            (Ok(v), Ok(_)) => Ok(v),
            (Ok(_), Err(e)) | (Err(e), Ok(_)) => Err(e),
            (Err(mut e1), Err(e2)) => {
                e1.messages.extend(e2.messages);
                Err(e1)
            }
        }
    }
}

/// Builds an [`Error`] with a formatted message, the way `nativelink_error`'s
/// `make_err!` does.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)*) => {
        $crate::Error::new($code, format!($($arg)*))
    };
}

/// Shorthand for `make_err!(Code::InvalidName, ...)`, mirroring
/// `nativelink_error::make_input_err!`.
#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)*) => {
        $crate::make_err!($crate::Code::InvalidName, $($arg)*)
    };
}

/// Asserts a condition, returning an `Internal` error if it fails. Mirrors
/// `nativelink_error::error_if!`.
#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            return Err($crate::make_err!($crate::Code::Internal, $($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_tip_appends_context_without_losing_code() {
        let result: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "boom"));
        let err = result.err_tip(|| "while doing the thing").unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(err.messages.len(), 2);
    }

    #[test]
    fn merge_prefers_first_error_but_keeps_both_messages() {
        let a: Result<(), Error> = Err(make_err!(Code::Internal, "a failed"));
        let b: Result<(), Error> = Err(make_err!(Code::NotFound, "b failed"));
        let merged = a.merge(b).unwrap_err();
        assert_eq!(merged.code, Code::Internal);
        assert_eq!(merged.messages, vec!["a failed", "b failed"]);
    }

    #[test]
    fn http_status_mapping_matches_contract() {
        assert_eq!(Code::InvalidName.http_status(), 400);
        assert_eq!(Code::NotFound.http_status(), 404);
        assert_eq!(Code::ConcurrentModification.http_status(), 503);
    }
}
