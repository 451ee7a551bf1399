//! WebSocket transport for Parley workers.
//!
//! Each `/ws` connection gets its own worker and pipeline context. Frames
//! are JSON text carrying the host/worker envelopes from
//! [`parley_core::protocol`]. `/health` reports every live connection's
//! model status.

pub mod connection;
pub mod server;
pub mod state;

pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
