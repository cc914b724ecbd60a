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

//! Maps the abstract [`filetracker_error::Code`] vocabulary onto HTTP
//! responses: status code from `Code::http_status`, short message in
//! `X-Exception`, full breadcrumb trail in the body.

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use filetracker_error::Error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let short = self.0.last_message().to_string();
        let body = self.0.messages.join(" :: ");
        let mut response = Response::builder()
            .status(status)
            .body(Body::from(body))
            .expect("status and body are always valid");
        if let Ok(value) = HeaderValue::from_str(&short) {
            response.headers_mut().insert("X-Exception", value);
        }
        tracing::warn!(code = ?self.0.code, message = %short, "request failed");
        response
    }
}
