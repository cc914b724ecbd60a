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

//! Process wiring for the filetracker HTTP server: load config, install the
//! tracing subscriber, run recovery once, open the storage engine, serve.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use filetracker_config::ServerConfig;
use filetracker_error::{Error, ResultExt};
use filetracker_service::{build_router, AppState};
use filetracker_store::StorageEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Shared content-addressed file store server")]
struct Args {
    /// Path to a JSON5 config file. Overrides individual flags where both
    /// are present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `blobs/`, `links/`, `locks/` and `db/`.
    #[arg(long)]
    data_dir: Option<String>,

    #[arg(long)]
    listen_address: Option<String>,

    #[arg(long)]
    listen_port: Option<u16>,

    /// Base URL of a legacy backend to fall back to on GET misses.
    #[arg(long)]
    fallback_url: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<ServerConfig, Error> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).err_tip(|| format!("Failed to read {}", path.display()))?;
            serde_json5::from_str(&raw).err_tip(|| format!("Failed to parse {} as config JSON5", path.display()))?
        }
        None => ServerConfig {
            data_dir: args
                .data_dir
                .clone()
                .ok_or_else(|| filetracker_error::make_err!(filetracker_error::Code::InvalidName, "Missing --data-dir (or --config)"))?,
            listen_address: "0.0.0.0".to_string(),
            listen_port: 7000,
            fallback_url: None,
            lock_retry: filetracker_config::LockRetryConfig::default(),
            log_level: "info".to_string(),
        },
    };

    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(listen_address) = &args.listen_address {
        config.listen_address = listen_address.clone();
    }
    if let Some(listen_port) = args.listen_port {
        config.listen_port = listen_port;
    }
    if args.fallback_url.is_some() {
        config.fallback_url = args.fallback_url.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.log_level = log_level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Recovery owns the whole tree lock for its run, so it must complete
    // before the engine (and therefore any worker task) touches the store.
    tracing::info!(data_dir = %config.data_dir, "running recovery pass before serving");
    let report = filetracker_store::recover(std::path::Path::new(&config.data_dir))?;
    tracing::info!(
        repaired = report.repaired_digests.len(),
        removed_dangling_links = report.removed_dangling_links.len(),
        removed_orphan_blobs = report.removed_orphan_blobs.len(),
        "recovery complete"
    );

    let engine = StorageEngine::open(&config.data_dir, config.lock_retry)?;
    let state = AppState::new(Arc::new(engine), config.fallback_url.clone());
    let router = build_router(state);

    let addr = format!("{}:{}", config.listen_address, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await.err_tip(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, fallback_url = ?config.fallback_url, "listening");
    axum::serve(listener, router).await.err_tip(|| "Server loop exited with an error".to_string())?;
    Ok(())
}
