//! Core abstractions for the session gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` - Per-connection identity and settings bag
//! - `GateError` - Error kinds shared by every gateway component
//! - `GateConfig` - Listener and framing configuration
//! - Connection, Storage and session-learner traits

pub mod config;
pub mod error;
pub mod session;
pub mod traits;

pub use config::GateConfig;
pub use error::{GateError, Result};
pub use session::{MergeOutcome, Session, SessionId, Settings, SharedSession};
pub use traits::{Conn, SessionLearner, SessionStorage, StorageError};
