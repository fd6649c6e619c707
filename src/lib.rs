//! `conduit` multiplexes three kinds of traffic over a single authenticated
//! TCP stream: free-form typed messages, correlated request/response calls,
//! and keep-alive probes. The server accepts and pools connections; the
//! client keeps one session alive and reconnects with backoff. Both ends
//! share the same framed wire protocol and connection state machine.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod payload;
pub mod prelude;
pub mod router;
pub mod rpc;
pub mod server;
pub mod time;

pub use crate::auth::PeerInfo;
pub use crate::client::Client;
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::error::{Error, HandlerFault, Result};
pub use crate::net::codec::{Frame, FrameKind, PROTOCOL_VERSION};
pub use crate::net::connection::{ConnectionHandle, ConnectionState, ConnectionStats, Role};
pub use crate::router::{MethodSchema, ParamKind, ParamSpec, Router};
pub use crate::server::Server;

// Payload objects are rmpv values; re-exported so embedders do not need a
// direct rmpv dependency.
pub use rmpv::Value;
