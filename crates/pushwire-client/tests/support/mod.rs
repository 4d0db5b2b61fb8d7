//! Scripted transport and event recorder shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pushwire_client::{
    ClientError, ClientResult, ClientTransport, Connection, ConnectionState, NegotiationResponse,
    StateChange, TransportLink,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub fn response(version: Option<&str>, disconnect: f64, keep_alive: Option<f64>) -> NegotiationResponse {
    NegotiationResponse {
        protocol_version: version.map(str::to_string),
        connection_id: "conn-1".into(),
        connection_token: "token-1".into(),
        disconnect_timeout: disconnect,
        keep_alive_timeout: keep_alive,
    }
}

#[derive(Default)]
pub struct Calls {
    pub negotiate: AtomicUsize,
    pub start: AtomicUsize,
    pub send: AtomicUsize,
    pub abort: AtomicUsize,
    pub lost: AtomicUsize,
    pub dispose: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A transport whose behaviour is fixed up front.
pub struct ScriptedTransport {
    pub calls: Calls,
    negotiation: Mutex<Option<ClientResult<NegotiationResponse>>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    during_start: Vec<String>,
    link: Mutex<Option<TransportLink>>,
    pub sent: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(negotiation: ClientResult<NegotiationResponse>) -> Self {
        Self {
            calls: Calls::default(),
            negotiation: Mutex::new(Some(negotiation)),
            gate: Mutex::new(None),
            during_start: Vec::new(),
            link: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Negotiates protocol 1.2 with a 30s disconnect timeout and no keep-alive.
    pub fn accepting() -> Self {
        Self::new(Ok(response(Some("1.2"), 30.0, None)))
    }

    /// Hold `negotiate` until the returned sender fires or is dropped.
    pub fn gated(mut self) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        self.gate = Mutex::new(Some(rx));
        (self, tx)
    }

    /// Push `payloads` through the link while `start` is running.
    pub fn receiving_during_start(mut self, payloads: &[&str]) -> Self {
        self.during_start = payloads.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Link captured by `start`.
    pub fn link(&self) -> TransportLink {
        self.link
            .lock()
            .clone()
            .expect("transport was never started")
    }
}

#[async_trait]
impl ClientTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn negotiate(&self, _link: &TransportLink) -> ClientResult<NegotiationResponse> {
        self.calls.negotiate.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.negotiation
            .lock()
            .take()
            .unwrap_or_else(|| Err(ClientError::negotiation("negotiated twice")))
    }

    async fn start(&self, link: &TransportLink, _cancel: CancellationToken) -> ClientResult<()> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        *self.link.lock() = Some(link.clone());
        for payload in &self.during_start {
            link.on_received(payload.clone());
        }
        Ok(())
    }

    async fn send(&self, _link: &TransportLink, payload: String) -> ClientResult<()> {
        self.calls.send.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn abort(&self, _link: &TransportLink, _timeout: Duration) {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
    }

    fn lost_connection(&self, _link: &TransportLink) {
        self.calls.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.calls.dispose.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a connection announced, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(StateChange),
    Received(String),
    Error(ClientError),
    Closed,
    Reconnecting,
    Reconnected,
    Slow,
}

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Seen>>>);

impl Recorder {
    pub fn attach(conn: &Connection) -> Self {
        let recorder = Self::default();
        let r = recorder.clone();
        conn.on_state_changed(move |change| r.push(Seen::State(*change)));
        let r = recorder.clone();
        conn.on_received(move |payload| {
            r.push(Seen::Received(payload.to_string()));
            Ok(())
        });
        let r = recorder.clone();
        conn.on_error(move |error| r.push(Seen::Error(error.clone())));
        let r = recorder.clone();
        conn.on_closed(move || r.push(Seen::Closed));
        let r = recorder.clone();
        conn.on_reconnecting(move || r.push(Seen::Reconnecting));
        let r = recorder.clone();
        conn.on_reconnected(move || r.push(Seen::Reconnected));
        let r = recorder.clone();
        conn.on_connection_slow(move || r.push(Seen::Slow));
        recorder
    }

    fn push(&self, seen: Seen) {
        self.0.lock().push(seen);
    }

    pub fn events(&self) -> Vec<Seen> {
        self.0.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&Seen) -> bool) -> usize {
        self.0.lock().iter().filter(|s| f(s)).count()
    }

    pub fn received(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::Received(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.0
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::State(change) => Some(change.new),
                _ => None,
            })
            .collect()
    }
}

pub fn connection() -> Connection {
    Connection::new("http://localhost:8080/push").expect("valid url")
}
