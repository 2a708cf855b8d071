//! Codec and router contract between the wire and the backend.

use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use gate_core::Result;

use crate::Agent;

/// A message type with a registered wire identifier.
pub trait Message: Send + Sync + 'static {
    /// Wire identifier of this message type.
    const ID: &'static str;
}

/// Body of a decoded inbound message.
pub enum DecodedBody {
    /// Payload decoded into the type registered for the identifier.
    Typed(Box<dyn Any + Send>),
    /// Undecoded payload for raw-passthrough destinations.
    Raw(Bytes),
}

/// An inbound message, decoded and ready to route.
pub struct Decoded {
    /// Registered identifier the message arrived under.
    pub id: String,
    pub body: DecodedBody,
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            DecodedBody::Typed(_) => "typed",
            DecodedBody::Raw(_) => "raw",
        };
        f.debug_struct("Decoded")
            .field("id", &self.id)
            .field("body", &body)
            .finish()
    }
}

/// Pluggable codec and router.
///
/// Registration happens once, before traffic starts. After that a processor
/// is shared read-only by every agent.
pub trait Processor: Send + Sync {
    /// Decode one inbound frame.
    ///
    /// # Errors
    /// Returns a decode error for malformed envelopes, unknown identifiers
    /// or payload type mismatches.
    fn unmarshal(&self, data: &[u8]) -> Result<Decoded>;

    /// Encode an outbound value registered under `id`.
    ///
    /// # Errors
    /// Returns an encode error if `id` was never registered or `msg` is not
    /// the type registered for it.
    fn marshal(&self, id: &str, msg: &dyn Any) -> Result<Vec<Bytes>>;

    /// Dispatch a decoded message to its registered destination.
    ///
    /// # Errors
    /// Returns a route error if the identifier has no destination.
    fn route(&self, msg: Decoded, agent: &Arc<Agent>) -> Result<()>;
}
