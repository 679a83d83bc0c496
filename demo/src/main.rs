//! MCP over a Unix socket: a small calculator server and a client that talks to it.
//!
//! ```text
//! mcp-uds-demo server --socket /tmp/calc.sock
//! mcp-uds-demo client --socket /tmp/calc.sock
//! ```
//!
//! Logs go to stderr; set `RUST_LOG=debug` to see the transport at work.

mod client;
mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mcp_uds::ENV_SOCKET_PATH;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Demo server and client for the MCP Unix domain socket transport
#[derive(Parser, Debug)]
#[command(name = "mcp-uds-demo", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the calculator tools until Ctrl-C
    Server {
        /// Socket path to listen on
        #[arg(long, env = ENV_SOCKET_PATH)]
        socket: PathBuf,

        /// Stop after the first client disconnects instead of waiting for another
        #[arg(long)]
        no_restart: bool,
    },
    /// Ping the server and list its tools
    Client {
        /// Socket path of a running server
        #[arg(long, env = ENV_SOCKET_PATH)]
        socket: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Server { socket, no_restart } => server::run(socket, !no_restart).await,
        Command::Client { socket } => client::run(socket).await,
    }
}
