//! Push server speaking the pushwire frame protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Args;
use futures_util::{SinkExt, StreamExt};
use pushwire_core::{ClientFrame, NegotiationResponse, ProtocolVersion, ServerFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::protocol::{Command, Tick, Update};

#[derive(Debug, Args)]
pub struct Cmd {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Protocol version announced in the handshake
    #[arg(long, default_value_t = ProtocolVersion::SUPPORTED.to_string())]
    protocol: String,

    /// Seconds the server keeps a dropped connection around
    #[arg(long, default_value_t = 30.0)]
    disconnect_timeout: f64,

    /// Keep-alive timeout in seconds; 0 disables keep-alive frames
    #[arg(long, default_value_t = 10.0)]
    keep_alive: f64,

    /// Milliseconds between ticks
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, default_value = "PUSH")]
    symbol: String,
}

struct ServerState {
    cmd: Cmd,
    next_id: AtomicU64,
    sequence: AtomicU64,
    /// connection token -> connection id
    sessions: Mutex<HashMap<String, String>>,
}

pub async fn run(cmd: Cmd) -> anyhow::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], cmd.port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}/push", addr);

    let state = Arc::new(ServerState {
        cmd,
        next_id: AtomicU64::new(1),
        sequence: AtomicU64::new(0),
        sessions: Mutex::new(HashMap::new()),
    });

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, state).await {
                tracing::warn!("Connection error from {}: {}", client_addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let mut uri = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = Some(req.uri().clone());
        Ok::<_, ErrorResponse>(resp)
    })
    .await?;
    let uri = uri.ok_or_else(|| anyhow::anyhow!("upgrade without a request uri"))?;
    let query: HashMap<String, String> = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let (mut sink, mut stream) = ws.split();

    let token = if uri.path().ends_with("/connect") {
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let connection_id = format!("conn-{id}");
        let token = format!("token-{id}");
        state
            .sessions
            .lock()
            .await
            .insert(token.clone(), connection_id.clone());

        let keep_alive = state.cmd.keep_alive;
        let negotiate = ServerFrame::Negotiate(NegotiationResponse {
            protocol_version: Some(state.cmd.protocol.clone()),
            connection_id: connection_id.clone(),
            connection_token: token.clone(),
            disconnect_timeout: state.cmd.disconnect_timeout,
            keep_alive_timeout: (keep_alive > 0.0).then_some(keep_alive),
        });
        sink.send(Message::Text(serde_json::to_string(&negotiate)?.into()))
            .await?;
        tracing::info!("{} connected from {}", connection_id, addr);
        token
    } else if uri.path().ends_with("/reconnect") {
        let token = query
            .get("connectionToken")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("reconnect without a connection token"))?;
        let Some(connection_id) = state.sessions.lock().await.get(&token).cloned() else {
            anyhow::bail!("unknown connection token {token}");
        };
        tracing::info!(
            "{} reconnected from {} after message {}",
            connection_id,
            addr,
            query.get("messageId").map_or("-", String::as_str)
        );
        token
    } else {
        anyhow::bail!("unknown endpoint {}", uri.path());
    };

    let mut ticks = tokio::time::interval(Duration::from_millis(state.cmd.interval_ms));
    let keep_alive_period = Duration::from_secs_f64((state.cmd.keep_alive / 2.0).max(0.5));
    let mut keep_alives = tokio::time::interval(keep_alive_period);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                let Message::Text(text) = msg else { continue };
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Send { payload }) => {
                        let note = match serde_json::from_str::<Command>(&payload) {
                            Ok(Command::Say { text }) => Update::Note { text },
                            Err(_) => Update::Note { text: payload },
                        };
                        let frame = data(&state, &note)?;
                        sink.send(Message::Text(frame.into())).await?;
                    }
                    Ok(ClientFrame::Abort) => {
                        tracing::info!("{} aborted", addr);
                        state.sessions.lock().await.remove(&token);
                        break;
                    }
                    Err(e) => tracing::warn!("Invalid frame: {}", e),
                }
            }

            _ = ticks.tick() => {
                let sequence = state.sequence.load(Ordering::Relaxed);
                let tick = Update::Tick(Tick {
                    sequence,
                    symbol: state.cmd.symbol.clone(),
                    price: 100.0 + (sequence as f64 * 0.7).sin() * 5.0,
                });
                let frame = data(&state, &tick)?;
                sink.send(Message::Text(frame.into())).await?;
            }

            _ = keep_alives.tick(), if state.cmd.keep_alive > 0.0 => {
                let frame = serde_json::to_string(&ServerFrame::KeepAlive)?;
                sink.send(Message::Text(frame.into())).await?;
            }
        }
    }

    tracing::debug!("Connection closed: {}", addr);
    Ok(())
}

fn data(state: &ServerState, update: &Update) -> anyhow::Result<String> {
    let sequence = state.sequence.fetch_add(1, Ordering::Relaxed);
    let frame = ServerFrame::Data {
        message_id: Some(sequence.to_string()),
        payload: serde_json::to_string(update)?,
    };
    Ok(serde_json::to_string(&frame)?)
}
