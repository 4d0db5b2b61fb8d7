//! Transport adapter contract.
//!
//! A transport performs the handshake request and the live message exchange
//! for one kind of channel. The connection drives it through
//! [`ClientTransport`]; the transport reports back through the
//! [`TransportLink`] it is handed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use pushwire_core::{ConnectionState, NegotiationResponse};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connection::Inner;
use crate::error::{ClientError, ClientResult};
use crate::options::{ConnectionOptions, Credentials};

/// One kind of channel (WebSocket, server-sent events, polling, ...).
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Short name, used in diagnostics and as the `transport` query value.
    fn name(&self) -> &str;

    /// Perform the handshake.
    async fn negotiate(&self, link: &TransportLink) -> ClientResult<NegotiationResponse>;

    /// Begin steady-state operation. Resolves once receiving has begun;
    /// inbound payloads are pushed through [`TransportLink::on_received`].
    /// Work spawned here must stop when `cancel` fires.
    async fn start(&self, link: &TransportLink, cancel: CancellationToken) -> ClientResult<()>;

    async fn send(&self, link: &TransportLink, payload: String) -> ClientResult<()>;

    /// Best-effort notice to the server that the client is leaving.
    /// Failures are traced, never returned.
    async fn abort(&self, link: &TransportLink, timeout: Duration);

    /// The heartbeat declared the connection stale; drop it and re-establish.
    fn lost_connection(&self, link: &TransportLink);

    /// Release resources. Called once the start attempt is torn down.
    fn dispose(&self) {}
}

/// A transport's handle back into its connection.
///
/// Links are bound to one start attempt: once that attempt has been torn
/// down every callback is a no-op and reads return empty values.
#[derive(Clone)]
pub struct TransportLink {
    inner: Weak<Inner>,
    attempt: u64,
}

impl TransportLink {
    pub(crate) fn new(inner: &Arc<Inner>, attempt: u64) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            attempt,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&Arc<Inner>) -> T) -> Option<T> {
        self.inner.upgrade().map(|inner| f(&inner))
    }

    /// Whether the start attempt this link belongs to is still current.
    pub fn is_current(&self) -> bool {
        self.with(|inner| inner.is_current_attempt(self.attempt))
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.with(|inner| inner.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Base endpoint, always ending in `/`.
    pub fn url(&self) -> Option<Url> {
        self.with(|inner| inner.url.clone())
    }

    /// Build `{url}{path}?{query}` including the application query,
    /// `transport=<name>`, and whatever identity is currently known.
    pub fn endpoint(&self, path: &str, transport: &str) -> ClientResult<Url> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| ClientError::invalid_operation("connection dropped"))?;
        let mut url = inner.url.join(path)?;
        let identity = inner.identity();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &inner.query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("transport", transport);
            if let Some(token) = &identity.connection_token {
                pairs.append_pair("connectionToken", token);
            }
            if let Some(message_id) = &identity.message_id {
                pairs.append_pair("messageId", message_id);
            }
            if let Some(groups_token) = &identity.groups_token {
                pairs.append_pair("groupsToken", groups_token);
            }
        }
        Ok(url)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.with(|inner| inner.identity().connection_id).flatten()
    }

    pub fn connection_token(&self) -> Option<String> {
        self.with(|inner| inner.identity().connection_token)
            .flatten()
    }

    pub fn message_id(&self) -> Option<String> {
        self.with(|inner| inner.identity().message_id).flatten()
    }

    pub fn groups_token(&self) -> Option<String> {
        self.with(|inner| inner.identity().groups_token).flatten()
    }

    /// Snapshot of the pass-through settings.
    pub fn options(&self) -> ConnectionOptions {
        self.with(|inner| inner.options.read().clone())
            .unwrap_or_default()
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.options().headers
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.options().credentials
    }

    /// Deliver an inbound payload through the receive queue.
    pub fn on_received(&self, payload: impl Into<String>) {
        let payload = payload.into();
        self.with(|inner| inner.on_received(self.attempt, payload));
    }

    /// Record that something (payload or keep-alive) arrived.
    pub fn mark_last_message(&self) {
        self.with(|inner| inner.mark_last_message(self.attempt));
    }

    pub fn set_message_id(&self, message_id: impl Into<String>) {
        let message_id = message_id.into();
        self.with(|inner| {
            inner.update_identity(self.attempt, |identity| {
                identity.message_id = Some(message_id);
            })
        });
    }

    pub fn set_groups_token(&self, groups_token: impl Into<String>) {
        let groups_token = groups_token.into();
        self.with(|inner| {
            inner.update_identity(self.attempt, |identity| {
                identity.groups_token = Some(groups_token);
            })
        });
    }

    /// The transport lost its channel and is trying to recover.
    pub fn on_reconnecting(&self) {
        self.with(|inner| inner.begin_reconnecting(self.attempt));
    }

    /// The transport recovered its channel.
    pub fn on_reconnected(&self) {
        self.with(|inner| inner.on_reconnected(self.attempt));
    }

    /// A steady-state failure. Surfaced through the error event only.
    pub fn on_error(&self, error: ClientError) {
        self.with(|inner| {
            if inner.is_current_attempt(self.attempt) {
                inner.raise_error(&error);
            }
        });
    }
}
