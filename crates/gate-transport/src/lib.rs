//! Transports and composition root for the session gateway.
//!
//! Provides:
//! - JSON envelope processor
//! - TCP transport with length-prefixed framing
//! - WebSocket transport (feature: websocket)
//! - `Gate` - wires listeners, directory and bus together

pub mod gate;
pub mod protocol;
mod queue;
pub mod tcp;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use gate::{Gate, GateBuilder};
pub use protocol::{JsonProcessor, Routed};
pub use tcp::{Framing, TcpConn};
