//! Convenience imports for embedders.

pub use crate::auth::PeerInfo;
pub use crate::client::Client;
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::error::{Error, HandlerFault, Result};
pub use crate::net::connection::{ConnectionHandle, ConnectionState, ConnectionStats};
pub use crate::payload;
pub use crate::router::{MethodSchema, ParamKind, ParamSpec};
pub use crate::server::Server;
pub use rmpv::Value;
