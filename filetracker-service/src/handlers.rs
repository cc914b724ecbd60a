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

//! Endpoint handlers: each maps one HTTP verb/path onto a `StorageEngine`
//! call, translating the wire headers (`last_modified`, `Content-Encoding`,
//! `SHA256-Checksum`, `Logical-Size`) to and from the engine's arguments.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use filetracker_error::{make_input_err, Code, Error, ResultExt};
use filetracker_util::Digest;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    last_modified: Option<String>,
}

#[derive(Serialize)]
struct VersionResponse {
    protocol_versions: Vec<u32>,
}

/// `PUT /files/<name>`. The body is streamed straight into the blob store --
/// never buffered whole in memory -- via a `StreamReader` wrapping the
/// request body's data stream.
pub async fn put_file(
    State(state): State<AppState>,
    AxumPath(raw_name): AxumPath<String>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let name = logical_name(&raw_name);
    let version = version_from_request(query.last_modified.as_deref(), &headers)?;
    let compressed = is_gzip(&headers);
    let hint = upload_hint(&headers)?;
    let size_hint = declared_content_length(&headers)?;

    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(stream);

    let outcome = state
        .engine
        .store_stream(&name, version, reader, size_hint, compressed, hint)
        .await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .expect("status and empty body are always valid");
    set_version_headers(response.headers_mut(), outcome.version, outcome.logical_size);
    Ok(response)
}

/// `GET /files/<name>`.
pub async fn get_file(State(state): State<AppState>, AxumPath(raw_name): AxumPath<String>) -> Result<Response, ApiError> {
    file_response(state, raw_name, false).await
}

/// `HEAD /files/<name>` -- identical headers to `GET`, empty body.
pub async fn head_file(State(state): State<AppState>, AxumPath(raw_name): AxumPath<String>) -> Result<Response, ApiError> {
    file_response(state, raw_name, true).await
}

/// `DELETE /files/<name>`.
pub async fn delete_file(
    State(state): State<AppState>,
    AxumPath(raw_name): AxumPath<String>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = logical_name(&raw_name);
    let version = version_from_request(query.last_modified.as_deref(), &headers)?;
    // A stale-version delete is a no-op per invariant 7, but the wire
    // contract doesn't distinguish it from an actual removal -- both are 200.
    state.engine.delete(&name, version).await?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /list/<prefix>`.
pub async fn list_files(
    State(state): State<AppState>,
    AxumPath(raw_prefix): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let cutoff = match query.last_modified.as_deref() {
        Some(raw) => parse_http_date(raw)?,
        None => now_as_version(),
    };

    let entries = state.engine.list_with_mtime(&raw_prefix)?;
    let mut body = String::new();
    for (name, mtime) in entries {
        if mtime <= cutoff {
            body.push_str(&name);
            body.push('\n');
        }
    }
    Ok((StatusCode::OK, body).into_response())
}

/// `GET /version`.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        protocol_versions: vec![2],
    })
}

pub(crate) fn router_routes() -> Router<AppState> {
    use axum::routing::{get, put};
    Router::new()
        .route(
            "/files/*name",
            put(put_file).get(get_file).head(head_file).delete(delete_file),
        )
        .route("/list/*prefix", get(list_files))
        .route("/version", get(version))
}

async fn file_response(state: AppState, raw_name: String, head_only: bool) -> Result<Response, ApiError> {
    let name = logical_name(&raw_name);
    let entry = match state.engine.stat(&name) {
        Ok(entry) => entry,
        Err(e) if e.code == Code::NotFound && !head_only => {
            return match &state.fallback_url {
                Some(fallback) => Ok(redirect_to_fallback(fallback, &raw_name)),
                None => Err(e.into()),
            };
        }
        Err(e) => return Err(e.into()),
    };

    let logical_size = state.engine.logical_size(&name)?;
    let file = state.engine.open(&name)?;
    let compressed_len = file
        .metadata()
        .err_tip(|| format!("Failed to stat blob backing {name}"))?
        .len();

    let body = if head_only {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(tokio::fs::File::from_std(file)))
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .expect("status and body are always valid");
    let response_headers = response.headers_mut();
    set_version_headers(response_headers, entry.version, logical_size);
    response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&compressed_len.to_string()).expect("decimal strings are valid header values"),
    );
    Ok(response)
}

fn redirect_to_fallback(fallback: &str, raw_name: &str) -> Response {
    let location = format!("{}/files/{}", fallback.trim_end_matches('/'), raw_name);
    let location_header =
        HeaderValue::from_str(&location).unwrap_or_else(|_| HeaderValue::from_static("/files/"));
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location_header)
        .body(Body::empty())
        .expect("status and empty body are always valid")
}

fn logical_name(raw: &str) -> String {
    format!("/{raw}")
}

/// `Content-Length` is a hard requirement on uploads (some request-body
/// readers never signal EOF on their own). The engine re-checks the actual
/// byte count it streamed against this value once the upload completes.
fn declared_content_length(headers: &HeaderMap) -> Result<u64, Error> {
    headers
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| make_input_err!("Missing required Content-Length header"))?
        .to_str()
        .map_err(|_| make_input_err!("Content-Length header is not valid UTF-8"))?
        .parse::<u64>()
        .map_err(|_| make_input_err!("Content-Length header is not a valid integer"))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false)
}

fn upload_hint(headers: &HeaderMap) -> Result<Option<(Digest, u64)>, Error> {
    let (Some(digest_hdr), Some(size_hdr)) = (headers.get("SHA256-Checksum"), headers.get("Logical-Size")) else {
        return Ok(None);
    };
    let digest_str = digest_hdr
        .to_str()
        .map_err(|_| make_input_err!("SHA256-Checksum header is not valid UTF-8"))?;
    let digest = Digest::parse(digest_str)?;
    let size_str = size_hdr
        .to_str()
        .map_err(|_| make_input_err!("Logical-Size header is not valid UTF-8"))?;
    let size = size_str
        .parse::<u64>()
        .map_err(|_| make_input_err!("Logical-Size {size_str:?} is not a valid integer"))?;
    Ok(Some((digest, size)))
}

/// Per §6 the version travels as the `last_modified` query parameter in
/// RFC 2822 form, or (protocol-1 clients) the `Last-Modified` header.
fn version_from_request(query_param: Option<&str>, headers: &HeaderMap) -> Result<i64, Error> {
    let raw = query_param
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| make_input_err!("Missing required last_modified parameter"))?;
    parse_http_date(&raw)
}

fn parse_http_date(raw: &str) -> Result<i64, Error> {
    let parsed =
        httpdate::parse_http_date(raw).map_err(|_| make_input_err!("last_modified {raw:?} is not a valid HTTP date"))?;
    let seconds = parsed
        .duration_since(UNIX_EPOCH)
        .map_err(|_| make_input_err!("last_modified {raw:?} predates the epoch"))?
        .as_secs();
    Ok(seconds as i64)
}

fn now_as_version() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn version_to_http_date(version: i64) -> HeaderValue {
    let time = UNIX_EPOCH + std::time::Duration::from_secs(version.max(0) as u64);
    HeaderValue::from_str(&httpdate::fmt_http_date(time)).expect("formatted HTTP dates are valid header values")
}

fn set_version_headers(headers: &mut HeaderMap, version: i64, logical_size: u64) {
    headers.insert(header::LAST_MODIFIED, version_to_http_date(version));
    headers.insert(
        "Logical-Size",
        HeaderValue::from_str(&logical_size.to_string()).expect("decimal strings are valid header values"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http_date_round_trips_through_format() {
        let version = parse_http_date("Mon, 02 Jan 2023 00:00:05 GMT").unwrap();
        let formatted = httpdate::fmt_http_date(UNIX_EPOCH + std::time::Duration::from_secs(version as u64));
        assert_eq!(formatted, "Mon, 02 Jan 2023 00:00:05 GMT");
    }

    #[test]
    fn parse_http_date_rejects_garbage() {
        assert!(parse_http_date("not a date").is_err());
    }

    #[test]
    fn is_gzip_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        assert!(is_gzip(&headers));
    }

    #[test]
    fn upload_hint_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "SHA256-Checksum",
            HeaderValue::from_static("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
        );
        assert!(upload_hint(&headers).unwrap().is_none());
    }
}
