//! WebSocket transport: channel registry, wire envelope, method handlers,
//! and server assembly.

pub mod channels;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use channels::{ChannelId, ChannelRegistry};
pub use handlers::HandlerState;
pub use rpc::{WireRequest, WireResponse};
pub use server::{start, ServerConfig, ServerError, ServerHandle};
