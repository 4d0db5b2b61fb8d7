//! Client-side connection lifecycle for pushwire.
//!
//! A [`Connection`] negotiates with a push endpoint, drives a transport,
//! watches liveness with a heartbeat, and delivers inbound payloads to
//! subscribers in arrival order.
//!
//! ```no_run
//! # async fn demo() -> pushwire_client::ClientResult<()> {
//! use pushwire_client::Connection;
//!
//! let conn = Connection::new("http://localhost:8080/push")?;
//! conn.on_received(|payload| {
//!     println!("{payload}");
//!     Ok(())
//! });
//! conn.start().await?;
//! conn.send("hello").await?;
//! conn.stop().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod events;
mod guard;
mod handle;
mod heartbeat;
mod negotiation;
mod options;
mod receive_queue;
mod timer;
mod trace;
mod transport;
mod websocket;

pub use connection::{Connection, ConnectionBuilder, TransportFactory};
pub use error::{ClientError, ClientResult};
pub use events::{
    ErrorHandler, ReceivedHandler, SignalHandler, StateChangedHandler, SubscriptionId,
};
pub use handle::StartHandle;
pub use heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatMonitor};
pub use negotiation::{KeepAliveData, NegotiationResult};
pub use options::{ConnectionOptions, Credentials, TraceLevels};
pub use receive_queue::{DrainHandle, ReceiveQueue};
pub use timer::Delayed;
pub use transport::{ClientTransport, TransportLink};
pub use websocket::WebSocketTransport;

pub use pushwire_core::{ConnectionState, NegotiationResponse, ProtocolVersion, StateChange};
