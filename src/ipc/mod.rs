//! IPC over a local named pipe
//!
//! Architecture:
//! - protocol.rs: wire types (requests, responses, notifications)
//! - handler.rs: RPC method dispatch and error sanitization
//! - server.rs: named-pipe listener, per-connection reader, broadcast

pub mod handler;
pub mod protocol;

#[cfg(windows)]
pub mod server;

pub use handler::Handler;
pub use protocol::{Notification, Request, Response};

#[cfg(windows)]
pub use server::Server;
