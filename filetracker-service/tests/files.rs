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

//! Drives the router directly with `tower::ServiceExt::oneshot`, mirroring
//! the wire-protocol scenarios in the storage-engine contract.

use std::io::Read;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use filetracker_config::LockRetryConfig;
use filetracker_service::{build_router, AppState};
use filetracker_store::StorageEngine;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use sha2::{Digest as _, Sha256};
use tempfile::tempdir;
use tower::ServiceExt;

fn state(dir: &std::path::Path) -> AppState {
    let engine = StorageEngine::open(dir, LockRetryConfig { attempts: 5, delay_ms: 5 }).unwrap();
    AppState::new(Arc::new(engine), None)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn put_then_get_round_trips_gzip_decoded_content() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));

    let request = Request::builder()
        .method("PUT")
        .uri("/files/put.txt")
        .header("Last-Modified", "Mon, 02 Jan 2023 00:00:05 GMT")
        .header("Content-Length", "5")
        .body(Body::from("hello"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("Logical-Size").unwrap(), "5");

    let request = Request::builder().method("GET").uri("/files/put.txt").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("Content-Encoding").unwrap(), "gzip");
    assert_eq!(response.headers().get("Logical-Size").unwrap(), "5");

    let compressed = body_bytes(response).await;
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    assert_eq!(decoded, b"hello");
}

#[tokio::test]
async fn get_missing_file_is_404() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));
    let request = Request::builder().method("GET").uri("/files/missing.txt").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("X-Exception"));
}

#[tokio::test]
async fn put_with_precomputed_digest_skips_server_side_hashing() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));

    let payload = b"precomputed";
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, payload).unwrap();
    let gzip_bytes = encoder.finish().unwrap();
    let digest_hex = {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hex::encode(hasher.finalize())
    };

    let request = Request::builder()
        .method("PUT")
        .uri("/files/compressed.bin")
        .header("Last-Modified", "Mon, 02 Jan 2023 00:00:05 GMT")
        .header("Content-Encoding", "gzip")
        .header("Content-Length", gzip_bytes.len().to_string())
        .header("SHA256-Checksum", digest_hex)
        .header("Logical-Size", payload.len().to_string())
        .body(Body::from(gzip_bytes))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn list_of_a_nonexistent_prefix_is_400() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));
    let request = Request::builder().method("GET").uri("/list/never/existed").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_of_missing_name_is_404() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));
    let request = Request::builder()
        .method("DELETE")
        .uri("/files/nonexistent")
        .header("Last-Modified", "Mon, 02 Jan 2023 00:00:05 GMT")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_filters_by_cutoff_and_version_endpoint_reports_protocol_2() {
    let dir = tempdir().unwrap();
    let router = build_router(state(dir.path()));

    for (name, date) in [
        ("/a/old.txt", "Mon, 02 Jan 2023 00:00:05 GMT"),
        ("/a/new.txt", "Sun, 02 Jan 2028 00:00:05 GMT"),
    ] {
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/files{name}"))
            .header("Last-Modified", date)
            .header("Content-Length", "1")
            .body(Body::from("x"))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = Request::builder()
        .method("GET")
        .uri("/list/a?last_modified=Mon,%2002%20Jan%202023%2000%3A00%3A10%20GMT")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(body, "a/old.txt\n");

    let request = Request::builder().method("GET").uri("/version").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(body, r#"{"protocol_versions":[2]}"#);
}
