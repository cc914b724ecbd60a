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

//! Thin CLI front end over `filetracker-client`: `get`/`cat`/`put`/`rm`/
//! `version`, flags mirroring the client's per-call options.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use filetracker_client::Client;
use filetracker_config::ClientConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "filetracker", about = "Filetracker client CLI")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Materializes `name` at `dest`, preferring the cache when possible.
    Get {
        name: String,
        dest: PathBuf,
        #[arg(long)]
        add_to_cache: bool,
        #[arg(long)]
        force_refresh: bool,
    },
    /// Streams `name`'s content to stdout.
    Cat {
        name: String,
        #[arg(long)]
        force_refresh: bool,
        #[arg(long)]
        serve_from_cache: bool,
    },
    /// Uploads `file` under `name` (which must carry an explicit version).
    Put {
        name: String,
        file: PathBuf,
        #[arg(long)]
        to_local_store: bool,
        #[arg(long)]
        to_remote_store: bool,
        #[arg(long)]
        compress_hint: bool,
    },
    /// Deletes `name` from every configured store.
    Rm { name: String },
    /// Prints the currently-stored version of `name`.
    Version { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = ClientConfig::from_env();
    tracing::debug!(?args, "dispatching command");
    let client = Client::new(&config)?;

    match args.command {
        Command::Get {
            name,
            dest,
            add_to_cache,
            force_refresh,
        } => {
            let resolved = client.get_file(&name, &dest, add_to_cache, force_refresh).await?;
            println!("{resolved}");
        }
        Command::Cat {
            name,
            force_refresh,
            serve_from_cache,
        } => {
            let (_, mut file) = client.get_stream(&name, force_refresh, serve_from_cache).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut file, &mut stdout).await?;
        }
        Command::Put {
            name,
            file,
            to_local_store,
            to_remote_store,
            compress_hint,
        } => {
            let resolved = client
                .put_file(&name, &file, to_local_store, to_remote_store, compress_hint)
                .await?;
            println!("{resolved}");
        }
        Command::Rm { name } => {
            client.delete_file(&name).await?;
        }
        Command::Version { name } => {
            let version = client.file_version(&name).await?;
            println!("{version}");
        }
    }
    Ok(())
}
