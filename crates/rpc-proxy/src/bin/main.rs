// Neurai RPC Proxy
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Neurai RPC Proxy Server
//!
//! Serves a whitelisted, cached view of a pool of Neurai nodes over HTTP, plus
//! the authenticated DePIN path.

use clap::{Parser, Subcommand};
use eyre::Result;
use neurai_common::init_logging;
use neurai_rpc_proxy::{
    config::{ProxyConfig, CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE},
    proxy::ProxyServerBuilder,
};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use tracing::info;

/// Neurai RPC Caching Proxy Server
#[derive(Parser, Debug)]
#[command(name = "neurai-rpc-proxy")]
#[command(about = "Neurai RPC Caching Proxy Server")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start RPC proxy server
    Server(ServerArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind to
    /// Example: --host 0.0.0.0
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (default: local_port from the config, then $PORT, then 80)
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Node health check interval in seconds
    #[arg(long, default_value = "10")]
    health_check_interval: u64,

    /// Upstream request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Directory with static files (overrides static_dir from the config)
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Also write logs to a rolling file in the temp directory
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
    }
}

/// Run the RPC proxy server
async fn run_server(args: ServerArgs) -> Result<()> {
    let config = match ProxyConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load {}: {e:#}", args.config.display());
            eprintln!("Create a config file with content like:\n{CONFIG_TEMPLATE}");
            std::process::exit(1);
        }
    };

    init_logging("neurai-rpc-proxy", args.log_file)?;

    let port = config.resolve_port(args.port);
    let ip = IpAddr::from_str(&args.host)?;
    let addr = SocketAddr::from((ip, port));

    let mut builder = ProxyServerBuilder::new(config)
        .health_check_interval(Duration::from_secs(args.health_check_interval))
        .request_timeout(Duration::from_secs(args.request_timeout));

    if let Some(static_dir) = args.static_dir {
        builder = builder.static_dir(static_dir);
    }

    let proxy = builder.build()?;

    info!("Starting Neurai RPC Proxy on {}", addr);
    tokio::select! {
        result = proxy.clone().serve(addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    proxy.shutdown();
    Ok(())
}
