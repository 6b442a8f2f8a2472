use std::str::FromStr;

use clap::{Parser, Subcommand};

mod colors;
mod config;
mod logs;
mod render;
mod serve;

#[derive(Parser, Debug)]
#[command(name = "kubetail", version, about = "Real-time multi-container log exploration for Kubernetes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream an interleaved, time-ordered log table from matching containers
    Logs(logs::LogsArgs),
    /// Run the GraphQL bridge for the web console
    Serve(serve::ServeArgs),
}

fn init_tracing() {
    let env = std::env::var("KUBETAIL_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    // Diagnostics go to stderr; stdout belongs to the log table.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let config = match config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("kubetail: {e:#}");
            std::process::exit(1);
        }
    };
    let outcome = match cli.command {
        Commands::Logs(args) => logs::run(args, config).await,
        Commands::Serve(args) => serve::run(args, config).await,
    };
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("kubetail: {e:#}");
            std::process::exit(1);
        }
    }
}
