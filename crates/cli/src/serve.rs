//! The `serve` command: run the GraphQL bridge for the web console.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use kubetail_kubehub::ConnectionManager;
use kubetail_server::csrf::CsrfConfig;
use kubetail_server::{build_schema, Server, ServerState};

use crate::config::FileConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7500;

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Don't open the console in a browser after startup
    #[arg(long)]
    pub skip_open: bool,
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
    /// Use the service account instead of a kubeconfig
    #[arg(long)]
    pub in_cluster: bool,
}

pub async fn run(args: ServeArgs, config: FileConfig) -> Result<i32> {
    let host = args
        .host
        .or(config.commands.serve.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(config.commands.serve.port).unwrap_or(DEFAULT_PORT);
    let address: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("bad listen address {host}:{port}"))?;

    let cm = if args.in_cluster {
        ConnectionManager::in_cluster()
    } else {
        ConnectionManager::desktop(args.kubeconfig.or(config.general.kubeconfig))
    };
    let schema = build_schema(ServerState { cm: Arc::new(cm), test_hooks: false });
    let csrf = if config.dashboard.csrf_protect.unwrap_or(false) {
        CsrfConfig::enabled()
    } else {
        CsrfConfig::default()
    };

    let (bound, server) = Server::new(address, schema, csrf).run().await;
    let skip_open = args.skip_open || config.commands.serve.skip_open.unwrap_or(false);
    info!(address = %bound, skip_open, "bridge serving");
    println!("kubetail bridge listening on http://{bound}/graphql");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    server.stop();
    Ok(130)
}
