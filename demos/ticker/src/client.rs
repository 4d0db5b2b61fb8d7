//! Ticker subscriber built on `pushwire_client::Connection`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use pushwire_client::{Connection, ConnectionOptions, TraceLevels};

use crate::protocol::{Command, Update};

#[derive(Debug, Args)]
pub struct Cmd {
    /// Push endpoint
    #[arg(long, default_value = "http://127.0.0.1:8080/push")]
    url: String,

    /// TOML file with connection options
    #[arg(long, env = "PUSHWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many ticks
    #[arg(long, default_value_t = 10)]
    count: usize,

    /// Diagnostics written to stderr (e.g. "state_changes,events")
    #[arg(long)]
    trace: Option<TraceLevels>,

    /// Send a note after connecting
    #[arg(long)]
    say: Option<String>,
}

fn load_options(path: Option<&PathBuf>) -> anyhow::Result<ConnectionOptions> {
    let Some(path) = path else {
        return Ok(ConnectionOptions::default());
    };
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

pub async fn run(cmd: Cmd) -> anyhow::Result<()> {
    let options = load_options(cmd.config.as_ref())?;
    let conn = Connection::builder(&cmd.url).options(options).build()?;
    if let Some(level) = cmd.trace {
        conn.set_trace_level(level);
        conn.set_trace_sink(Some(Box::new(std::io::stderr())));
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    conn.on_received(move |payload| {
        let update: Update = serde_json::from_str(payload)?;
        let _ = tx.send(update);
        Ok(())
    });
    conn.on_state_changed(|change| {
        tracing::info!("{} -> {}", change.old, change.new);
    });
    conn.on_connection_slow(|| tracing::warn!("Connection is slow"));
    conn.on_error(|e| tracing::warn!("Connection error: {}", e));
    conn.on_closed(|| tracing::info!("Connection closed"));

    conn.start().await?;
    tracing::info!(
        "Connected as {}",
        conn.connection_id().as_deref().unwrap_or("-")
    );

    if let Some(text) = cmd.say {
        conn.send_json(&Command::Say { text }).await?;
    }

    let mut ticks = 0;
    while ticks < cmd.count {
        let Some(update) = rx.recv().await else { break };
        match update {
            Update::Tick(tick) => {
                ticks += 1;
                println!("#{:<5} {} {:>8.2}", tick.sequence, tick.symbol, tick.price);
            }
            Update::Note { text } => println!("note: {text}"),
        }
    }

    conn.stop_with_timeout(Duration::from_secs(5)).await;
    Ok(())
}
