//! JSON envelope processor.
//!
//! Wire envelope, both directions:
//!
//! ```text
//! {"cmd": "<message id>", "data": "<JSON-encoded payload, as a string>"}
//! ```
//!
//! Every identifier is registered once, before traffic starts, together
//! with exactly one destination: a local handler, a router channel, or a
//! raw handler. Raw handlers receive the whole inbound frame untouched;
//! only `cmd` is read, and `data` may hold any JSON value or be absent.

use std::{any::Any, collections::HashMap, sync::Arc};

use bytes::Bytes;
use gate_core::{GateError, Result};
use gate_session::{Agent, Decoded, DecodedBody, Message, Processor};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;

type DecodeFn = fn(&str) -> serde_json::Result<Box<dyn Any + Send>>;
type EncodeFn = fn(&dyn Any) -> Option<serde_json::Result<String>>;
type TypedHandler = Box<dyn Fn(Box<dyn Any + Send>, &Arc<Agent>) -> Result<()> + Send + Sync>;
type RawHandler = Box<dyn Fn(&str, Bytes, &Arc<Agent>) + Send + Sync>;

/// A message handed to a router channel, with the agent it came from.
#[derive(Clone)]
pub struct Routed<M> {
    pub msg: M,
    pub agent: Arc<Agent>,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    cmd: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    cmd: &'a str,
    data: &'a str,
}

enum Codec {
    Typed { decode: DecodeFn, encode: EncodeFn },
    Raw,
}

enum Destination {
    Local(TypedHandler),
    Router(TypedHandler),
    Raw(RawHandler),
}

struct MsgInfo {
    codec: Codec,
    destination: Option<Destination>,
}

fn decode_as<M>(data: &str) -> serde_json::Result<Box<dyn Any + Send>>
where
    M: DeserializeOwned + Send + 'static,
{
    Ok(Box::new(serde_json::from_str::<M>(data)?))
}

fn encode_as<M>(msg: &dyn Any) -> Option<serde_json::Result<String>>
where
    M: Serialize + 'static,
{
    msg.downcast_ref::<M>().map(serde_json::to_string)
}

fn downcast<M: Message>(msg: Box<dyn Any + Send>) -> Result<M> {
    msg.downcast::<M>()
        .map(|m| *m)
        .map_err(|_| GateError::Route(format!("payload for {} has the wrong type", M::ID)))
}

/// JSON envelope codec and router.
#[derive(Default)]
pub struct JsonProcessor {
    msg_info: HashMap<String, MsgInfo>,
}

impl JsonProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed message under `M::ID`.
    ///
    /// # Errors
    /// Returns a config error if the identifier is already registered.
    pub fn register<M>(&mut self) -> Result<()>
    where
        M: Message + Serialize + DeserializeOwned,
    {
        self.insert(
            M::ID,
            Codec::Typed {
                decode: decode_as::<M>,
                encode: encode_as::<M>,
            },
            None,
        )
    }

    /// Register `id` as a raw message; `handler` gets the whole frame.
    ///
    /// # Errors
    /// Returns a config error if the identifier is already registered.
    pub fn register_raw<F>(&mut self, id: &str, handler: F) -> Result<()>
    where
        F: Fn(&str, Bytes, &Arc<Agent>) + Send + Sync + 'static,
    {
        self.insert(id, Codec::Raw, Some(Destination::Raw(Box::new(handler))))
    }

    /// Handle `M` in-process, on the receiving agent's task.
    ///
    /// # Errors
    /// Returns a config error if `M` is not registered or already has a
    /// destination.
    pub fn set_handler<M, F>(&mut self, handler: F) -> Result<()>
    where
        M: Message,
        F: Fn(M, &Arc<Agent>) + Send + Sync + 'static,
    {
        self.set_destination(
            M::ID,
            Destination::Local(Box::new(move |msg: Box<dyn Any + Send>, agent: &Arc<Agent>| {
                handler(downcast::<M>(msg)?, agent);
                Ok(())
            })),
        )
    }

    /// Forward `M` to a router channel served by backend workers.
    ///
    /// # Errors
    /// Returns a config error if `M` is not registered or already has a
    /// destination.
    pub fn set_router<M: Message>(&mut self, router: mpsc::UnboundedSender<Routed<M>>) -> Result<()> {
        self.set_destination(
            M::ID,
            Destination::Router(Box::new(move |msg: Box<dyn Any + Send>, agent: &Arc<Agent>| {
                let routed = Routed {
                    msg: downcast::<M>(msg)?,
                    agent: Arc::clone(agent),
                };
                router
                    .send(routed)
                    .map_err(|_| GateError::Route(format!("router for {} is closed", M::ID)))
            })),
        )
    }

    fn insert(&mut self, id: &str, codec: Codec, destination: Option<Destination>) -> Result<()> {
        if self.msg_info.contains_key(id) {
            return Err(GateError::Config(format!("message {id} is already registered")));
        }
        self.msg_info
            .insert(id.to_string(), MsgInfo { codec, destination });
        Ok(())
    }

    fn set_destination(&mut self, id: &str, destination: Destination) -> Result<()> {
        let info = self
            .msg_info
            .get_mut(id)
            .ok_or_else(|| GateError::Config(format!("message {id} not registered")))?;
        if info.destination.is_some() {
            return Err(GateError::Config(format!("message {id} already has a destination")));
        }
        info.destination = Some(destination);
        Ok(())
    }
}

impl Processor for JsonProcessor {
    fn unmarshal(&self, data: &[u8]) -> Result<Decoded> {
        let envelope: InboundEnvelope =
            serde_json::from_slice(data).map_err(|e| GateError::Decode(e.to_string()))?;
        let info = self
            .msg_info
            .get(&envelope.cmd)
            .ok_or_else(|| GateError::Decode(format!("message {} not registered", envelope.cmd)))?;

        let body = match &info.codec {
            Codec::Raw => DecodedBody::Raw(Bytes::copy_from_slice(data)),
            Codec::Typed { decode, .. } => {
                let Some(serde_json::Value::String(payload)) = envelope.data else {
                    return Err(GateError::Decode(format!(
                        "message {} needs string data",
                        envelope.cmd
                    )));
                };
                let msg = decode(&payload).map_err(|e| {
                    GateError::Decode(format!("message {}: {e}", envelope.cmd))
                })?;
                DecodedBody::Typed(msg)
            }
        };
        Ok(Decoded {
            id: envelope.cmd,
            body,
        })
    }

    fn marshal(&self, id: &str, msg: &dyn Any) -> Result<Vec<Bytes>> {
        let info = self
            .msg_info
            .get(id)
            .ok_or_else(|| GateError::Encode(format!("message {id} not registered")))?;
        let Codec::Typed { encode, .. } = &info.codec else {
            return Err(GateError::Encode(format!("message {id} is raw-only")));
        };
        let data = encode(msg)
            .ok_or_else(|| GateError::Encode(format!("value is not the type registered for {id}")))?
            .map_err(|e| GateError::Encode(e.to_string()))?;

        let frame = serde_json::to_vec(&OutboundEnvelope { cmd: id, data: &data })
            .map_err(|e| GateError::Encode(e.to_string()))?;
        Ok(vec![Bytes::from(frame)])
    }

    fn route(&self, msg: Decoded, agent: &Arc<Agent>) -> Result<()> {
        let Decoded { id, body } = msg;
        let destination = self
            .msg_info
            .get(&id)
            .and_then(|info| info.destination.as_ref())
            .ok_or_else(|| GateError::Route(format!("message {id} has no destination")))?;

        match (destination, body) {
            (Destination::Local(handler) | Destination::Router(handler), DecodedBody::Typed(m)) => {
                handler(m, agent)
            }
            (Destination::Raw(handler), DecodedBody::Raw(payload)) => {
                handler(&id, payload, agent);
                Ok(())
            }
            _ => Err(GateError::Route(format!("message {id} body does not match its destination"))),
        }
    }
}
