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

//! Wires the endpoint handlers into an `axum::Router`, with request tracing
//! the way the teacher wires its gRPC services into a `tonic` server.

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the full HTTP surface: `/files/<name>`, `/list/<prefix>`,
/// `/version`, over `state`. `state.fallback_url` controls whether GET
/// misses behave as a migration shim or a plain 404.
pub fn build_router(state: AppState) -> Router {
    handlers::router_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
