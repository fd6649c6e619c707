//! The networking modules handle framing, transport and the per-connection
//! state machine shared by the server and client facades.

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod framer;
pub mod support;
pub mod transport;
