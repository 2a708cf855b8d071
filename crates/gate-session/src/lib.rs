//! Agent runtime and session directory for the session gateway.
//!
//! Provides:
//! - `Agent` - Per-connection receive loop and write surface
//! - `Processor` - Pluggable codec and router contract
//! - `SessionDirectory` - Registry of live sessions and remote-control operations
//! - `DirectoryBus` - Typed request channel in front of the directory
//! - `SessionHandle` - Backend-side proxy for one session
//! - Storage implementations (memory)

pub mod agent;
pub mod bus;
pub mod conn;
pub mod directory;
pub mod handle;
pub mod processor;
pub mod storage;

pub use agent::{Agent, AgentLearner, UserData};
pub use bus::{DirectoryBus, DirectoryRequest};
pub use conn::{MemoryConn, MemoryPeer};
pub use directory::SessionDirectory;
pub use handle::SessionHandle;
pub use processor::{Decoded, DecodedBody, Message, Processor};
