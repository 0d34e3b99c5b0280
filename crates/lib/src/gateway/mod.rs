//! Gateway client: WebSocket protocol layer to the locally running gateway.
//!
//! First frame on every transport is the `connect` handshake; after that, correlated
//! requests (req/res) and unsolicited events flow in both directions on one socket.

mod backoff;
mod connection;
mod error;
mod events;
mod pending;
mod protocol;

pub use backoff::ReconnectPolicy;
pub use connection::{
    ConnectOptions, ConnectionState, GatewayConnection, GatewayConnectionBuilder,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use error::GatewayError;
pub use events::{EventBus, Subscription};
pub use pending::{PendingTable, RequestResult};
pub use protocol::{
    ClientInfo, ConnectAuth, ConnectParams, DecodeError, ErrorShape, EventFrame, Frame, HelloAuth,
    HelloOk, HelloPolicy, HelloServer, RequestFrame, ResponseFrame, CONNECT_METHOD, MAX_PROTOCOL,
    MIN_PROTOCOL,
};
