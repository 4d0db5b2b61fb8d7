//! Price ticker over pushwire.
//!
//! Run a server and a client in two terminals:
//!   cargo run -p pushwire-demo-ticker -- server --port 8080
//!   cargo run -p pushwire-demo-ticker -- client --url http://127.0.0.1:8080/push --count 20
//!
//! Stop the server mid-stream and restart it within the disconnect timeout to
//! watch the client reconnect.

mod client;
mod protocol;
mod server;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push ticks to every connected client
    Server(server::Cmd),

    /// Subscribe to a ticker server and print what arrives
    Client(client::Cmd),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pushwire_demo_ticker=info".parse()?)
                .add_directive("pushwire_client=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Commands::Server(cmd) => server::run(cmd).await,
        Commands::Client(cmd) => client::run(cmd).await,
    }
}
