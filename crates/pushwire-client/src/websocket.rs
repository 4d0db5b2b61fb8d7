//! WebSocket transport.
//!
//! The handshake is the first frame on `{url}connect`; the same socket then
//! carries data. When the socket drops (or the heartbeat declares it stale)
//! the reader reconnects to `{url}reconnect` until it succeeds or the start
//! attempt is torn down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pushwire_core::{ClientFrame, NegotiationResponse, ServerFrame};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::options::ConnectionOptions;
use crate::transport::{ClientTransport, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const NAME: &str = "webSockets";

/// Transport over a single WebSocket.
#[derive(Default)]
pub struct WebSocketTransport {
    /// Socket opened by `negotiate`, handed to the reader by `start`.
    pending: parking_lot::Mutex<Option<WsStream>>,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    lost: Arc<Notify>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    fn name(&self) -> &str {
        NAME
    }

    async fn negotiate(&self, link: &TransportLink) -> ClientResult<NegotiationResponse> {
        let options = link.options();
        let mut stream = open(link.endpoint("connect", NAME)?, &options).await?;

        let frame = time::timeout(options.connect_timeout, next_frame(&mut stream))
            .await
            .map_err(|_| ClientError::timeout(options.connect_timeout))??;
        let ServerFrame::Negotiate(response) = frame else {
            return Err(ClientError::negotiation(
                "server did not open with a negotiate frame",
            ));
        };

        *self.pending.lock() = Some(stream);
        Ok(response)
    }

    async fn start(&self, link: &TransportLink, cancel: CancellationToken) -> ClientResult<()> {
        let stream = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| ClientError::transport("start called before negotiate"))?;
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);

        tokio::spawn(run_reader(
            link.clone(),
            source,
            self.writer.clone(),
            self.lost.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn send(&self, _link: &TransportLink, payload: String) -> ClientResult<()> {
        let frame = serde_json::to_string(&ClientFrame::Send { payload })?;
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| ClientError::transport("socket is not open"))?;
        sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn abort(&self, _link: &TransportLink, timeout: Duration) {
        let notice = async {
            let frame = serde_json::to_string(&ClientFrame::Abort)?;
            let mut writer = self.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                sink.send(Message::Text(frame.into())).await?;
                sink.close().await?;
            }
            writer.take();
            Ok::<_, ClientError>(())
        };
        match time::timeout(timeout, notice).await {
            Ok(Ok(())) => tracing::debug!("abort sent"),
            Ok(Err(e)) => tracing::debug!(error = %e, "abort failed"),
            Err(_) => tracing::debug!(?timeout, "abort timed out"),
        }
    }

    fn lost_connection(&self, _link: &TransportLink) {
        self.lost.notify_one();
    }

    fn dispose(&self) {
        self.pending.lock().take();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

fn websocket_url(mut url: Url) -> ClientResult<Url> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ClientError::invalid_url(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::invalid_url(format!("cannot use {scheme} for {url}")))?;
    Ok(url)
}

fn header_value(value: &str) -> ClientResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ClientError::transport(format!("invalid header value: {e}")))
}

/// Build the upgrade request with headers, cookies and credentials applied.
fn request(url: &Url, options: &ConnectionOptions) -> ClientResult<Request> {
    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();

    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::transport(format!("invalid header name {name}: {e}")))?;
        headers.insert(name, header_value(value)?);
    }
    if !options.cookies.is_empty() {
        let mut cookies: Vec<_> = options.cookies.iter().collect();
        cookies.sort();
        let cookie = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(header::COOKIE, header_value(&cookie)?);
    }
    if let Some(credentials) = &options.credentials {
        headers.insert(header::AUTHORIZATION, header_value(&credentials.authorization())?);
    }
    if options.proxy.is_some() || !options.client_certificates.is_empty() {
        tracing::debug!("proxy and client certificates are not applied to websocket upgrades");
    }
    Ok(request)
}

async fn open(endpoint: Url, options: &ConnectionOptions) -> ClientResult<WsStream> {
    let url = websocket_url(endpoint)?;
    let request = request(&url, options)?;
    tracing::debug!(%url, "opening websocket");
    let (stream, _response) = time::timeout(
        options.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| ClientError::timeout(options.connect_timeout))??;
    Ok(stream)
}

async fn next_frame(stream: &mut WsStream) -> ClientResult<ServerFrame> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::transport("socket closed during handshake"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn dispatch(link: &TransportLink, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Data {
            message_id,
            payload,
        }) => {
            if let Some(message_id) = message_id {
                link.set_message_id(message_id);
            }
            link.on_received(payload);
        }
        Ok(ServerFrame::KeepAlive) => link.mark_last_message(),
        Ok(ServerFrame::Groups { groups_token }) => link.set_groups_token(groups_token),
        Ok(ServerFrame::Negotiate(_)) => tracing::debug!("ignoring negotiate frame mid-stream"),
        Err(e) => link.on_error(e.into()),
    }
}

async fn run_reader(
    link: TransportLink,
    mut source: WsSource,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    lost: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = lost.notified() => tracing::debug!("socket declared stale"),
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&link, &text);
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => tracing::info!("server closed the socket"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => link.on_error(e.into()),
            },
        }

        link.on_reconnecting();
        writer.lock().await.take();
        let Some(stream) = reconnect(&link, &cancel).await else {
            return;
        };
        let (sink, next) = stream.split();
        *writer.lock().await = Some(sink);
        source = next;
        link.on_reconnected();
    }
}

/// Retry the reconnect endpoint until it opens or `cancel` fires.
async fn reconnect(link: &TransportLink, cancel: &CancellationToken) -> Option<WsStream> {
    loop {
        let options = link.options();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = time::sleep(options.reconnect_delay) => {}
        }
        if !link.is_current() {
            return None;
        }

        let attempt = async { open(link.endpoint("reconnect", NAME)?, &options).await };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = attempt => match result {
                Ok(stream) => return Some(stream),
                Err(e) => tracing::debug!(error = %e, "reconnect attempt failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Credentials;

    #[test]
    fn maps_http_schemes_to_websocket() {
        let url = Url::parse("http://localhost:8080/push/connect").unwrap();
        assert_eq!(websocket_url(url).unwrap().scheme(), "ws");
        let url = Url::parse("https://example.com/push/").unwrap();
        assert_eq!(websocket_url(url).unwrap().scheme(), "wss");
        let url = Url::parse("ftp://example.com/").unwrap();
        assert!(websocket_url(url).is_err());
    }

    #[test]
    fn request_carries_headers_cookies_and_credentials() {
        let mut options = ConnectionOptions::default();
        options.headers.insert("x-app".into(), "demo".into());
        options.cookies.insert("b".into(), "2".into());
        options.cookies.insert("a".into(), "1".into());
        options.credentials = Some(Credentials::Bearer {
            token: "secret".into(),
        });

        let url = Url::parse("ws://localhost:8080/push/connect").unwrap();
        let request = request(&url, &options).unwrap();
        let headers = request.headers();
        assert_eq!(headers["x-app"], "demo");
        assert_eq!(headers[header::COOKIE], "a=1; b=2");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn rejects_invalid_header_names() {
        let mut options = ConnectionOptions::default();
        options.headers.insert("bad header".into(), "x".into());
        let url = Url::parse("ws://localhost/").unwrap();
        assert!(matches!(
            request(&url, &options),
            Err(ClientError::Transport { .. })
        ));
    }
}
