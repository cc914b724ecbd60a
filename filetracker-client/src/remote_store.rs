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

//! The client's view of a remote `filetracker-server`: one `reqwest::Client`
//! plus protocol negotiation, memoized after the first successful call.

use std::path::Path;
use std::time::UNIX_EPOCH;

use filetracker_error::{make_err, Code, Error, ResultExt};
use filetracker_util::Digest;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};

/// Protocol versions this client understands. Capability 2 adds gzip
/// upload, the SHA-256 digest header, and DELETE support.
const SUPPORTED_PROTOCOLS: &[u32] = &[1, 2];

#[derive(Debug, Deserialize)]
struct VersionResponse {
    protocol_versions: Vec<u32>,
}

/// Outcome of a successful remote `store` or `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEntry {
    pub version: i64,
    pub logical_size: u64,
}

pub struct RemoteStore {
    http: reqwest::Client,
    base_url: String,
    protocol: RwLock<Option<u32>>,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        RemoteStore {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            protocol: RwLock::new(None),
        }
    }

    /// Negotiates (and memoizes) the protocol version shared with the
    /// server: `GET /version`, treating a 404 as protocol 1, and picks the
    /// highest version present in both `SUPPORTED_PROTOCOLS` and the
    /// server's advertised set.
    pub async fn protocol_version(&self) -> Result<u32, Error> {
        if let Some(version) = *self.protocol.read().await {
            return Ok(version);
        }
        let mut guard = self.protocol.write().await;
        if let Some(version) = *guard {
            return Ok(version);
        }

        let url = format!("{}/version", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed GET {url}"))?;

        let advertised = if response.status() == reqwest::StatusCode::NOT_FOUND {
            vec![1]
        } else if response.status().is_success() {
            let parsed: VersionResponse = response.json().await.map_err(transport_err)?;
            parsed.protocol_versions
        } else {
            return Err(status_err(response.status(), &url));
        };

        let negotiated = advertised
            .into_iter()
            .filter(|v| SUPPORTED_PROTOCOLS.contains(v))
            .max()
            .ok_or_else(|| {
                make_err!(
                    Code::ProtocolNegotiationError,
                    "{} advertises no protocol version this client supports",
                    self.base_url
                )
            })?;
        *guard = Some(negotiated);
        Ok(negotiated)
    }

    /// `HEAD /files/<name>`: the currently-stored version and logical size,
    /// without fetching the body.
    pub async fn stat(&self, name: &str) -> Result<RemoteEntry, Error> {
        let url = self.file_url(name);
        let response = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed HEAD {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(make_err!(Code::NotFound, "{name} not found on {}", self.base_url));
        }
        if !response.status().is_success() {
            return Err(status_err(response.status(), &url));
        }
        entry_from_headers(response.headers())
    }

    /// `GET /files/<name>`, streaming the decompressed body straight to
    /// `dest` -- the response is never buffered whole in memory.
    /// `reqwest`'s transparent gzip decoding handles the `Content-Encoding`
    /// the server always sets, so the bytes landing on disk are already
    /// plain.
    pub async fn get_to_path(&self, name: &str, dest: &Path) -> Result<RemoteEntry, Error> {
        let url = self.file_url(name);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed GET {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(make_err!(Code::NotFound, "{name} not found on {}", self.base_url));
        }
        if !response.status().is_success() {
            return Err(status_err(response.status(), &url));
        }
        let entry = entry_from_headers(response.headers())?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = StreamReader::new(stream);
        let mut file = tokio::fs::File::create(dest)
            .await
            .err_tip(|| format!("Failed to create {}", dest.display()))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .err_tip(|| format!("Failed to write {}", dest.display()))?;
        Ok(entry)
    }

    /// `PUT /files/<name>`, optionally gzip-compressing `source` first and
    /// sending the digest/size headers protocol 2 uses to skip server-side
    /// hashing. The uncompressed path streams `source` straight off disk;
    /// the compress-hint path still has to materialize the gzip output in
    /// memory first, since its size has to be known up front for
    /// `Content-Length`.
    pub async fn put(&self, name: &str, version: i64, source: &Path, compress: bool) -> Result<RemoteEntry, Error> {
        let protocol = self.protocol_version().await?;

        let (body, content_length, content_encoding, digest_header, logical_size) = if compress && protocol >= 2 {
            let raw = tokio::fs::read(source)
                .await
                .err_tip(|| format!("Failed to read {}", source.display()))?;
            let digest = Digest::of_bytes(&raw);
            let compressed = gzip_compress(&raw)?;
            let content_length = compressed.len() as u64;
            (
                reqwest::Body::from(compressed),
                content_length,
                Some("gzip"),
                Some(digest),
                raw.len() as u64,
            )
        } else {
            let content_length = tokio::fs::metadata(source)
                .await
                .err_tip(|| format!("Failed to stat {}", source.display()))?
                .len();
            let file = tokio::fs::File::open(source)
                .await
                .err_tip(|| format!("Failed to open {}", source.display()))?;
            (
                reqwest::Body::wrap_stream(ReaderStream::new(file)),
                content_length,
                None,
                None,
                content_length,
            )
        };

        let url = format!("{}?last_modified={}", self.file_url(name), encode_query(&version_to_http_date(version)));
        let mut request = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, content_length)
            .body(body);
        if let Some(encoding) = content_encoding {
            request = request.header(reqwest::header::CONTENT_ENCODING, encoding);
            request = request.header("Logical-Size", logical_size.to_string());
        }
        if let Some(digest) = &digest_header {
            request = request.header("SHA256-Checksum", digest.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed PUT {url}"))?;
        if !response.status().is_success() {
            return Err(status_err(response.status(), &url));
        }
        entry_from_headers(response.headers())
    }

    /// `DELETE /files/<name>`. Callers should only invoke this when
    /// [`RemoteStore::protocol_version`] is at least 2; capability 1 servers
    /// don't support deletion at all.
    pub async fn delete(&self, name: &str, version: i64) -> Result<(), Error> {
        let url = format!("{}?last_modified={}", self.file_url(name), encode_query(&version_to_http_date(version)));
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed DELETE {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(make_err!(Code::NotFound, "{name} not found on {}", self.base_url));
        }
        if !response.status().is_success() {
            return Err(status_err(response.status(), &url));
        }
        Ok(())
    }

    /// `GET /list/<prefix>[?last_modified=<cutoff>]`.
    pub async fn list(&self, prefix: &str, cutoff: Option<i64>) -> Result<Vec<String>, Error> {
        let mut url = format!("{}/list/{}", self.base_url, prefix.trim_start_matches('/'));
        if let Some(cutoff) = cutoff {
            url.push_str("?last_modified=");
            url.push_str(&encode_query(&version_to_http_date(cutoff)));
        }
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_err)
            .err_tip(|| format!("Failed GET {url}"))?;
        if !response.status().is_success() {
            return Err(status_err(response.status(), &url));
        }
        let body = response.text().await.map_err(transport_err)?;
        Ok(body.lines().map(str::to_string).collect())
    }

    fn file_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.base_url, name.trim_start_matches('/'))
    }
}

fn entry_from_headers(headers: &reqwest::header::HeaderMap) -> Result<RemoteEntry, Error> {
    let last_modified = headers
        .get(reqwest::header::LAST_MODIFIED)
        .ok_or_else(|| make_err!(Code::Internal, "Response is missing Last-Modified"))?
        .to_str()
        .map_err(|_| make_err!(Code::Internal, "Last-Modified header is not valid UTF-8"))?;
    let version = http_date_to_version(last_modified)?;
    let logical_size = headers
        .get("Logical-Size")
        .ok_or_else(|| make_err!(Code::Internal, "Response is missing Logical-Size"))?
        .to_str()
        .map_err(|_| make_err!(Code::Internal, "Logical-Size header is not valid UTF-8"))?
        .parse::<u64>()
        .map_err(|_| make_err!(Code::Internal, "Logical-Size header is not a valid integer"))?;
    Ok(RemoteEntry { version, logical_size })
}

fn http_date_to_version(raw: &str) -> Result<i64, Error> {
    let parsed = httpdate::parse_http_date(raw).map_err(|_| make_err!(Code::Internal, "Invalid HTTP date {raw:?}"))?;
    let seconds = parsed
        .duration_since(UNIX_EPOCH)
        .map_err(|_| make_err!(Code::Internal, "HTTP date {raw:?} predates the epoch"))?
        .as_secs();
    Ok(seconds as i64)
}

fn version_to_http_date(version: i64) -> String {
    let time = UNIX_EPOCH + std::time::Duration::from_secs(version.max(0) as u64);
    httpdate::fmt_http_date(time)
}

fn encode_query(raw: &str) -> String {
    // RFC 2822 dates use only alphanumerics, spaces, commas and colons; the
    // only byte that actually needs escaping in a query string is the space.
    raw.replace(' ', "%20").replace(':', "%3A").replace(',', "%2C")
}

fn gzip_compress(raw: &[u8]) -> Result<Vec<u8>, Error> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(raw).err_tip(|| "Failed to gzip-compress upload")?;
    encoder.finish().err_tip(|| "Failed to finalize gzip stream")
}

fn transport_err(e: reqwest::Error) -> Error {
    make_err!(Code::TransportError, "Transport error: {e}")
}

fn status_err(status: reqwest::StatusCode, url: &str) -> Error {
    make_err!(Code::TransportError, "Unexpected status {status} from {url}")
}

// `Digest` doesn't expose a constructor from raw bytes (only `DigestHasher`,
// for incremental streaming hashes); this does the same in one shot for a
// buffer already fully in memory.
trait DigestOfBytes {
    fn of_bytes(bytes: &[u8]) -> Digest;
}

impl DigestOfBytes for Digest {
    fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = filetracker_util::DigestHasher::new();
        hasher.update(bytes);
        hasher.finalize()
    }
}
