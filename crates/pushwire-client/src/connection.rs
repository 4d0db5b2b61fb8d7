//! The connection state machine.
//!
//! `Connection` owns the lifecycle state, the negotiated identity and the
//! activity timestamps. Transport callbacks, heartbeat ticks, the reconnect
//! guard and application calls all funnel through the same state lock.
//!
//! Locks, in acquisition order:
//! 1. `emitting`: reentrant; held from a state change until its
//!    state-changed (and closed) events have gone out, so handlers observe
//!    transitions in the order they happened;
//! 2. `lifecycle`: serializes start setup against stop teardown;
//! 3. `state`: state, identity, timestamps and the current start attempt.
//!
//! None is held across an `.await`. Only `emitting` is held while event
//! handlers run, and handlers may re-enter the connection on the same thread.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use pushwire_core::{ConnectionState, StateChange};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::events::{Events, SubscriptionId};
use crate::guard::ReconnectGuard;
use crate::handle::StartHandle;
use crate::heartbeat::{Beat, HeartbeatMonitor, assess};
use crate::negotiation::{KeepAliveData, NegotiationResult, Timing};
use crate::options::{ConnectionOptions, Credentials, TraceLevels};
use crate::receive_queue::ReceiveQueue;
use crate::trace::Tracer;
use crate::transport::{ClientTransport, TransportLink};
use crate::websocket::WebSocketTransport;

use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};

/// Creates a fresh transport for each `start`.
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn ClientTransport> + Send + Sync>;

/// Identity assigned by the server, cleared on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Identity {
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub groups_token: Option<String>,
    pub message_id: Option<String>,
}

/// Resources owned by one start attempt.
struct Attempt {
    id: u64,
    transport: Arc<dyn ClientTransport>,
    cancel: CancellationToken,
    queue: Arc<ReceiveQueue>,
    handle: StartHandle,
    monitor: Option<HeartbeatMonitor>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct StateData {
    state: ConnectionState,
    identity: Identity,
    last_message_at: Option<Instant>,
    last_active_at: Option<Instant>,
    timing: Option<Timing>,
    slow_warned: bool,
    attempt: Option<Attempt>,
}

impl StateData {
    fn attempt_is(&self, id: u64) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.id == id)
    }

    fn touch(&mut self, now: Instant) {
        self.last_message_at = Some(self.last_message_at.map_or(now, |at| at.max(now)));
    }
}

/// Work left over after the state flipped to disconnected.
struct Teardown {
    old: ConnectionState,
    connection_id: Option<String>,
    attempt: Option<Attempt>,
}

pub(crate) struct Inner {
    pub(crate) url: Url,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) options: RwLock<ConnectionOptions>,
    state: Mutex<StateData>,
    lifecycle: Mutex<()>,
    emitting: ReentrantMutex<()>,
    events: Events,
    tracer: Tracer,
    guard: ReconnectGuard,
    items: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    transport_factory: TransportFactory,
    next_attempt: AtomicU64,
}

impl Inner {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    pub(crate) fn identity(&self) -> Identity {
        self.state.lock().identity.clone()
    }

    pub(crate) fn is_current_attempt(&self, attempt: u64) -> bool {
        self.state.lock().attempt_is(attempt)
    }

    fn trace(&self, level: TraceLevels, args: fmt::Arguments<'_>) {
        let connection_id = self.state.lock().identity.connection_id.clone();
        self.tracer.trace(level, connection_id.as_deref(), args);
    }

    fn with_attempt<T>(&self, attempt: u64, f: impl FnOnce(&mut StateData) -> T) -> Option<T> {
        let mut state = self.state.lock();
        state.attempt_is(attempt).then(|| f(&mut *state))
    }

    /// Compare-and-set on the state. `update` runs under the same lock when
    /// the transition succeeds.
    fn transition(
        &self,
        attempt: Option<u64>,
        old: ConnectionState,
        new: ConnectionState,
        update: impl FnOnce(&mut StateData),
    ) -> bool {
        if !old.can_transition_to(new) {
            return false;
        }
        if new == Disconnected {
            return self.disconnect_where(|s| {
                s.state == old && attempt.is_none_or(|id| s.attempt_is(id))
            });
        }

        let _emitting = self.emitting.lock();
        let changed = {
            let mut state = self.state.lock();
            let matches = state.state == old && attempt.is_none_or(|id| state.attempt_is(id));
            if matches {
                state.state = new;
                update(&mut *state);
            }
            matches
        };

        if changed {
            self.trace(
                TraceLevels::STATE_CHANGES,
                format_args!("state changed from {old} to {new}"),
            );
            self.events.state_changed.emit(&StateChange { old, new });
        }
        changed
    }

    fn take_disconnect(&self, predicate: impl FnOnce(&StateData) -> bool) -> Option<Teardown> {
        let mut state = self.state.lock();
        if state.state == Disconnected || !predicate(&*state) {
            return None;
        }
        let old = std::mem::replace(&mut state.state, Disconnected);
        let identity = std::mem::take(&mut state.identity);
        state.last_message_at = None;
        state.last_active_at = None;
        state.timing = None;
        state.slow_warned = false;
        Some(Teardown {
            old,
            connection_id: identity.connection_id,
            attempt: state.attempt.take(),
        })
    }

    /// Callers hold `emitting` from `take_disconnect` through this call.
    fn finish_disconnect(&self, teardown: Teardown) {
        if let Some(attempt) = teardown.attempt {
            self.guard.disarm(attempt.id);
            attempt.cancel.cancel();
            if let Some(monitor) = &attempt.monitor {
                monitor.dispose();
            }
            // Fire and forget; in-flight delivery finishes on its own.
            let _ = attempt.queue.drain();
            attempt.transport.dispose();
        }

        self.tracer.trace(
            TraceLevels::STATE_CHANGES,
            teardown.connection_id.as_deref(),
            format_args!("state changed from {} to disconnected", teardown.old),
        );
        tracing::info!(
            connection_id = teardown.connection_id.as_deref(),
            "connection closed"
        );
        self.events.state_changed.emit(&StateChange {
            old: teardown.old,
            new: Disconnected,
        });
        self.events.closed.emit();
    }

    fn disconnect_where(&self, predicate: impl FnOnce(&StateData) -> bool) -> bool {
        let _emitting = self.emitting.lock();
        match self.take_disconnect(predicate) {
            Some(teardown) => {
                self.finish_disconnect(teardown);
                true
            }
            None => false,
        }
    }

    fn disconnect_attempt(&self, attempt: u64) -> bool {
        self.disconnect_where(|s| s.attempt_is(attempt))
    }

    pub(crate) fn raise_error(&self, error: &ClientError) {
        tracing::warn!(%error, "connection error");
        self.trace(TraceLevels::EVENTS, format_args!("error: {error}"));
        self.events.error.emit(error);
    }

    fn enqueue<F>(&self, attempt: u64, job: F) -> ClientResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let queue = self
            .with_attempt(attempt, |s| s.attempt.as_ref().map(|a| a.queue.clone()))
            .flatten()
            .ok_or(ClientError::Cancelled)?;
        queue.enqueue(job)
    }

    pub(crate) fn on_received(self: &Arc<Self>, attempt: u64, payload: String) {
        let queue = {
            let mut state = self.state.lock();
            if !state.attempt_is(attempt) {
                return;
            }
            state.touch(Instant::now());
            state.attempt.as_ref().map(|a| a.queue.clone())
        };
        let Some(queue) = queue else { return };

        self.trace(TraceLevels::MESSAGES, format_args!("received: {payload}"));
        let weak = Arc::downgrade(self);
        let queued = queue.enqueue(async move {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(&payload);
            }
        });
        if queued.is_err() {
            tracing::debug!("receive queue drained; dropping inbound message");
        }
    }

    fn deliver(&self, payload: &str) {
        for handler in self.events.received.snapshot() {
            let error = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => ClientError::callback(format!("{e:#}")),
                Err(panic) => ClientError::callback(panic_message(panic.as_ref())),
            };
            self.raise_error(&error);
        }
    }

    pub(crate) fn mark_last_message(&self, attempt: u64) {
        let now = Instant::now();
        self.with_attempt(attempt, |s| s.touch(now));
    }

    pub(crate) fn update_identity(&self, attempt: u64, f: impl FnOnce(&mut Identity)) {
        self.with_attempt(attempt, |s| f(&mut s.identity));
    }

    /// Connected -> Reconnecting; arms the reconnect guard.
    pub(crate) fn begin_reconnecting(self: &Arc<Self>, attempt: u64) -> bool {
        let window = self.with_attempt(attempt, |s| s.timing.map(|t| t.reconnect_window));
        let Some(Some(window)) = window else {
            return false;
        };
        if !self.transition(Some(attempt), Connected, Reconnecting, |_| {}) {
            return false;
        }

        let weak = Arc::downgrade(self);
        self.guard.arm(attempt, window, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire_reconnect(attempt);
            }
        });
        tracing::info!(?window, "connection lost, reconnecting");
        self.trace(TraceLevels::EVENTS, format_args!("reconnecting"));
        self.events.reconnecting.emit();
        true
    }

    /// Reconnecting -> Connected; cancels the reconnect guard.
    pub(crate) fn on_reconnected(&self, attempt: u64) -> bool {
        let now = Instant::now();
        let changed = self.transition(Some(attempt), Reconnecting, Connected, |s| {
            s.touch(now);
            s.last_active_at = Some(now);
            s.slow_warned = false;
        });
        if changed {
            self.guard.disarm(attempt);
            tracing::info!("connection recovered");
            self.trace(TraceLevels::EVENTS, format_args!("reconnected"));
            self.events.reconnected.emit();
        }
        changed
    }

    fn expire_reconnect(&self, attempt: u64) {
        let expired = self.disconnect_where(|s| s.state == Reconnecting && s.attempt_is(attempt));
        if expired {
            tracing::warn!("reconnect window elapsed; server has dropped the connection");
        }
    }

    fn beat(self: &Arc<Self>, attempt: u64) -> ControlFlow<()> {
        let now = Instant::now();
        let beat = {
            let mut state = self.state.lock();
            if !state.attempt_is(attempt) {
                return ControlFlow::Break(());
            }
            if state.state != Connected {
                return ControlFlow::Continue(());
            }
            let (Some(last_message_at), Some(last_active_at), Some(timing)) =
                (state.last_message_at, state.last_active_at, state.timing)
            else {
                return ControlFlow::Continue(());
            };

            let beat = assess(
                now,
                last_message_at,
                last_active_at,
                timing.keep_alive.as_ref(),
                timing.reconnect_window,
            );
            match beat {
                Beat::WindowExpired => Some(beat),
                Beat::Healthy => {
                    state.last_active_at = Some(now);
                    state.slow_warned = false;
                    None
                }
                Beat::Slow => {
                    state.last_active_at = Some(now);
                    (!std::mem::replace(&mut state.slow_warned, true)).then_some(beat)
                }
                Beat::TimedOut => {
                    state.last_active_at = Some(now);
                    Some(beat)
                }
            }
        };

        match beat {
            Some(Beat::Slow) => {
                tracing::info!("connection is slow");
                self.trace(TraceLevels::EVENTS, format_args!("connection slow"));
                self.events.connection_slow.emit();
            }
            Some(Beat::TimedOut) => {
                tracing::info!("keep-alive timed out");
                if self.begin_reconnecting(attempt) {
                    let transport = self
                        .with_attempt(attempt, |s| s.attempt.as_ref().map(|a| a.transport.clone()))
                        .flatten();
                    if let Some(transport) = transport {
                        transport.lost_connection(&TransportLink::new(self, attempt));
                    }
                }
            }
            Some(Beat::WindowExpired) => {
                tracing::warn!("heartbeat silent for longer than the reconnect window");
                self.disconnect_attempt(attempt);
                return ControlFlow::Break(());
            }
            Some(Beat::Healthy) | None => {}
        }
        ControlFlow::Continue(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("callback panicked: {msg}")
    } else {
        "callback panicked".to_string()
    }
}

/// Negotiate, start the transport, and wait for setup traffic to drain.
async fn establish(
    inner: &Arc<Inner>,
    attempt: u64,
    transport: &dyn ClientTransport,
    cancel: &CancellationToken,
    ready: oneshot::Sender<()>,
) -> ClientResult<()> {
    let link = TransportLink::new(inner, attempt);

    inner.trace(
        TraceLevels::EVENTS,
        format_args!("negotiating via {}", transport.name()),
    );
    let response = transport.negotiate(&link).await.map_err(|e| match e {
        ClientError::Negotiation { .. }
        | ClientError::ProtocolIncompatible { .. }
        | ClientError::Cancelled => e,
        other => ClientError::negotiation(other.to_string()),
    })?;
    let negotiated = NegotiationResult::from_response(response)?;
    let timing = Timing::new(&negotiated, inner.options.read().heartbeat_interval);
    tracing::debug!(
        connection_id = %negotiated.connection_id,
        reconnect_window = ?timing.reconnect_window,
        "negotiated"
    );

    inner
        .with_attempt(attempt, |s| {
            s.identity.connection_id = Some(negotiated.connection_id);
            s.identity.connection_token = Some(negotiated.connection_token);
            s.timing = Some(timing);
        })
        .ok_or(ClientError::Cancelled)?;

    transport.start(&link, cancel.clone()).await?;

    let now = Instant::now();
    let connected = inner.transition(Some(attempt), Connecting, Connected, |s| {
        s.touch(now);
        s.last_active_at = Some(now);
    });
    if !connected {
        return Err(ClientError::Cancelled);
    }

    let weak = Arc::downgrade(inner);
    let monitor = HeartbeatMonitor::start(timing.heartbeat_period, cancel, move || {
        match weak.upgrade() {
            Some(inner) => inner.beat(attempt),
            None => ControlFlow::Break(()),
        }
    });
    inner.with_attempt(attempt, |s| {
        if let Some(a) = s.attempt.as_mut() {
            a.monitor = Some(monitor);
        }
    });

    // Open the gate, then resolve only once everything queued so far ran.
    let _ = ready.send(());
    let (done_tx, done_rx) = oneshot::channel();
    inner
        .enqueue(attempt, async move {
            let _ = done_tx.send(());
        })
        .map_err(|_| ClientError::Cancelled)?;
    done_rx.await.map_err(|_| ClientError::Cancelled)
}

async fn run_start(
    inner: Arc<Inner>,
    attempt: u64,
    transport: Arc<dyn ClientTransport>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
    done: watch::Sender<Option<ClientResult<()>>>,
) {
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ClientError::Cancelled),
        result = establish(&inner, attempt, transport.as_ref(), &cancel, ready) => result,
    };

    match &result {
        Ok(()) => tracing::info!(transport = transport.name(), "connection started"),
        Err(ClientError::Cancelled) => {
            tracing::debug!("start attempt cancelled");
            inner.disconnect_attempt(attempt);
        }
        Err(error) => {
            inner.raise_error(error);
            inner.disconnect_attempt(attempt);
        }
    }
    done.send_replace(Some(result));
}

/// A logical connection to one push endpoint.
///
/// Cheap to clone; clones share the same connection. May be started and
/// stopped repeatedly.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to `url` with default options and the WebSocket transport.
    pub fn new(url: impl Into<String>) -> ClientResult<Self> {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.inner.query
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.identity().connection_id
    }

    pub fn connection_token(&self) -> Option<String> {
        self.inner.identity().connection_token
    }

    pub fn groups_token(&self) -> Option<String> {
        self.inner.identity().groups_token
    }

    pub fn set_groups_token(&self, groups_token: Option<String>) {
        self.inner.state.lock().identity.groups_token = groups_token;
    }

    pub fn message_id(&self) -> Option<String> {
        self.inner.identity().message_id
    }

    pub fn set_message_id(&self, message_id: Option<String>) {
        self.inner.state.lock().identity.message_id = message_id;
    }

    /// When the last payload or keep-alive arrived, while connected.
    pub fn last_message_at(&self) -> Option<Instant> {
        self.inner.state.lock().last_message_at
    }

    pub fn last_active_at(&self) -> Option<Instant> {
        self.inner.state.lock().last_active_at
    }

    pub fn disconnect_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().timing.map(|t| t.disconnect_timeout)
    }

    pub fn keep_alive(&self) -> Option<KeepAliveData> {
        self.inner.state.lock().timing.and_then(|t| t.keep_alive)
    }

    pub fn reconnect_window(&self) -> Option<Duration> {
        self.inner.state.lock().timing.map(|t| t.reconnect_window)
    }

    /// Compare-and-set the state.
    ///
    /// Succeeds only if the current state is `old` and `old -> new` is a
    /// lifecycle transition, firing exactly one state-changed event. A
    /// transition into `Disconnected` performs the full teardown.
    pub fn change_state(&self, old: ConnectionState, new: ConnectionState) -> bool {
        self.inner.transition(None, old, new, |_| {})
    }

    /// Start with a transport from the configured factory.
    pub fn start(&self) -> StartHandle {
        let transport = (self.inner.transport_factory)();
        self.start_with(transport)
    }

    /// Start with the given transport.
    ///
    /// While a start is in flight or the connection is up this returns the
    /// existing handle and `transport` is dropped unused.
    pub fn start_with(&self, transport: Arc<dyn ClientTransport>) -> StartHandle {
        let inner = &self.inner;
        let _emitting = inner.emitting.lock();
        let lifecycle = inner.lifecycle.lock();

        {
            let state = inner.state.lock();
            if state.state != Disconnected {
                return match &state.attempt {
                    Some(attempt) => attempt.handle.clone(),
                    None => StartHandle::ready(Err(ClientError::invalid_operation(format!(
                        "connection is {} without a start attempt",
                        state.state
                    )))),
                };
            }
        }

        let id = inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let queue = Arc::new(ReceiveQueue::new(ready_rx, cancel.clone()));
        let (handle, done_tx) = StartHandle::pending(id);

        {
            let mut state = inner.state.lock();
            state.state = Connecting;
            state.attempt = Some(Attempt {
                id,
                transport: transport.clone(),
                cancel: cancel.clone(),
                queue,
                handle: handle.clone(),
                monitor: None,
            });
        }
        drop(lifecycle);

        inner.trace(
            TraceLevels::STATE_CHANGES,
            format_args!("state changed from disconnected to connecting"),
        );
        inner.events.state_changed.emit(&StateChange {
            old: Disconnected,
            new: Connecting,
        });

        tokio::spawn(run_start(
            inner.clone(),
            id,
            transport,
            cancel,
            ready_tx,
            done_tx,
        ));
        handle
    }

    /// Stop with the configured default timeout.
    pub async fn stop(&self) {
        let timeout = self.inner.options.read().stop_timeout;
        self.stop_with_timeout(timeout).await;
    }

    /// Gracefully shut down. Never fails; problems are traced.
    ///
    /// Waits up to `timeout` for an in-flight start, drains the receive
    /// queue without waiting for it, stops the heartbeat, asks the transport
    /// to abort within `timeout`, then disconnects. A no-op while
    /// disconnected.
    ///
    /// Receive callbacks are synchronous, so a callback that wants to stop
    /// spawns this future. The start it waits on resolves once that callback
    /// returns.
    pub async fn stop_with_timeout(&self, timeout: Duration) {
        let inner = &self.inner;
        let current = {
            let state = inner.state.lock();
            state.attempt.as_ref().map(|a| (a.id, a.handle.clone()))
        };
        let Some((attempt, handle)) = current else {
            // Reached through `change_state` with no transport behind it.
            if inner.disconnect_where(|s| s.attempt.is_none()) {
                tracing::debug!("stopped a connection without a start attempt");
            }
            return;
        };

        inner.trace(TraceLevels::EVENTS, format_args!("stopping"));
        match time::timeout(timeout, handle.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::debug!(%error, "start failed before stop"),
            Err(_) => tracing::warn!(?timeout, "start did not settle before stop timeout"),
        }

        let transport = {
            let _lifecycle = inner.lifecycle.lock();
            let mut state = inner.state.lock();
            let Some(current) = state.attempt.as_mut().filter(|a| a.id == attempt) else {
                return;
            };
            let _ = current.queue.drain();
            if let Some(monitor) = current.monitor.take() {
                monitor.dispose();
            }
            current.transport.clone()
        };

        let link = TransportLink::new(inner, attempt);
        if time::timeout(timeout, transport.abort(&link, timeout))
            .await
            .is_err()
        {
            tracing::warn!(?timeout, "transport abort timed out");
        }

        let _emitting = inner.emitting.lock();
        let teardown = {
            let _lifecycle = inner.lifecycle.lock();
            inner.take_disconnect(|s| s.attempt_is(attempt))
        };
        if let Some(teardown) = teardown {
            inner.finish_disconnect(teardown);
        }
    }

    /// Send a raw payload.
    ///
    /// Fails with [`ClientError::InvalidOperation`] before touching the
    /// transport unless the connection is connected or reconnecting.
    pub async fn send(&self, payload: impl Into<String>) -> ClientResult<()> {
        let payload = payload.into();
        let (attempt, transport) = {
            let state = self.inner.state.lock();
            match (&state.state, &state.attempt) {
                (Connected | Reconnecting, Some(a)) => (a.id, a.transport.clone()),
                (current, _) => {
                    return Err(ClientError::invalid_operation(format!(
                        "data cannot be sent while {current}"
                    )));
                }
            }
        };

        self.inner
            .trace(TraceLevels::MESSAGES, format_args!("sending: {payload}"));
        transport
            .send(&TransportLink::new(&self.inner, attempt), payload)
            .await
    }

    /// Serialize `value` as JSON and send it.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> ClientResult<()> {
        let payload = serde_json::to_string(value)?;
        self.send(payload).await
    }

    /// Subscribe to received payloads. An `Err` or panic from the handler is
    /// reported through the error event and delivery continues.
    pub fn on_received<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.received.add(Arc::new(handler))
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.inner.events.error.add(Arc::new(handler))
    }

    pub fn on_closed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.closed.add(Arc::new(handler))
    }

    pub fn on_reconnecting<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.reconnecting.add(Arc::new(handler))
    }

    pub fn on_reconnected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.reconnected.add(Arc::new(handler))
    }

    pub fn on_state_changed<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.events.state_changed.add(Arc::new(handler))
    }

    pub fn on_connection_slow<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.connection_slow.add(Arc::new(handler))
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.remove(id)
    }

    /// Attach application state. Returns the previous value for `key`.
    pub fn set_item<T>(&self, key: impl Into<String>, value: T) -> Option<Arc<dyn Any + Send + Sync>>
    where
        T: Any + Send + Sync,
    {
        self.inner.items.write().insert(key.into(), Arc::new(value))
    }

    /// Fetch an item, if present and of type `T`.
    pub fn item<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.inner.items.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_item(&self, key: &str) -> bool {
        self.inner.items.write().remove(key).is_some()
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> ConnectionOptions {
        self.inner.options.read().clone()
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.inner.options.read().headers.clone()
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .options
            .write()
            .headers
            .insert(name.into(), value.into());
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        self.inner.options.write().headers.remove(name)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.options.read().credentials.clone()
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.inner.options.write().credentials = credentials;
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.inner.options.read().cookies.clone()
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .options
            .write()
            .cookies
            .insert(name.into(), value.into());
    }

    pub fn proxy(&self) -> Option<String> {
        self.inner.options.read().proxy.clone()
    }

    pub fn set_proxy(&self, proxy: Option<String>) {
        self.inner.options.write().proxy = proxy;
    }

    pub fn client_certificates(&self) -> Vec<Vec<u8>> {
        self.inner.options.read().client_certificates.clone()
    }

    /// Attach a DER-encoded client certificate. Only allowed while
    /// disconnected.
    pub fn add_client_certificate(&self, der: Vec<u8>) -> ClientResult<()> {
        let state = self.inner.state.lock();
        if state.state != Disconnected {
            return Err(ClientError::invalid_operation(
                "client certificates can only be added while disconnected",
            ));
        }
        self.inner.options.write().client_certificates.push(der);
        Ok(())
    }

    pub fn trace_level(&self) -> TraceLevels {
        self.inner.tracer.level()
    }

    pub fn set_trace_level(&self, level: TraceLevels) {
        self.inner.tracer.set_level(level);
        self.inner.options.write().trace_level = level;
    }

    /// Write trace lines to `sink` (or stop, with `None`).
    pub fn set_trace_sink(&self, sink: Option<Box<dyn Write + Send>>) {
        self.inner.tracer.set_sink(sink);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

fn websocket_factory() -> TransportFactory {
    Arc::new(|| Arc::new(WebSocketTransport::new()) as Arc<dyn ClientTransport>)
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    url: String,
    query: Vec<(String, String)>,
    options: ConnectionOptions,
    transport_factory: Option<TransportFactory>,
}

impl ConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            options: ConnectionOptions::default(),
            transport_factory: None,
        }
    }

    /// Add a query parameter sent with every request.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.options.credentials = Some(credentials);
        self
    }

    /// Use `factory` instead of the WebSocket transport for `start`.
    pub fn transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn ClientTransport> + Send + Sync + 'static,
    {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    /// Validate the URL and build the connection.
    ///
    /// The URL must not carry a query string; pass parameters through
    /// [`ConnectionBuilder::query`]. A trailing `/` is added if missing.
    pub fn build(self) -> ClientResult<Connection> {
        if self.url.contains('?') {
            return Err(ClientError::invalid_url(
                "url must not contain a query string; use query parameters instead",
            ));
        }
        let mut url = Url::parse(&self.url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let transport_factory = self
            .transport_factory
            .unwrap_or_else(websocket_factory);
        let tracer = Tracer::new(self.options.trace_level);

        Ok(Connection {
            inner: Arc::new(Inner {
                url,
                query: self.query,
                options: RwLock::new(self.options),
                state: Mutex::new(StateData::default()),
                lifecycle: Mutex::new(()),
                emitting: ReentrantMutex::new(()),
                events: Events::new(),
                tracer,
                guard: ReconnectGuard::new(),
                items: RwLock::new(HashMap::new()),
                transport_factory,
                next_attempt: AtomicU64::new(1),
            }),
        })
    }
}
