//! Per-connection agent: receive loop, writes and identity.

use std::{
    any::Any,
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use gate_core::{Conn, Session, SessionId, SharedSession};
use tracing::{debug, error};

use crate::{Message, Processor};

/// Listener for agent connect/disconnect events.
#[async_trait]
pub trait AgentLearner: Send + Sync {
    /// The agent realized its session on its first message.
    async fn connect(&self, agent: &Arc<Agent>);

    /// The agent's connection was torn down.
    async fn disconnect(&self, agent: &Arc<Agent>);
}

/// Opaque caller-attached state.
pub type UserData = Arc<dyn Any + Send + Sync>;

struct LiveSession {
    id: SessionId,
    state: SharedSession,
}

/// Runtime object bound 1:1 to a live connection.
///
/// The session is created on the first received message and never
/// replaced afterwards.
pub struct Agent {
    conn: Arc<dyn Conn>,
    processor: Option<Arc<dyn Processor>>,
    learner: Arc<dyn AgentLearner>,
    server_id: String,
    agent_id: AtomicI64,
    table_id: AtomicI64,
    user_data: Mutex<Option<UserData>>,
    session: OnceLock<LiveSession>,
    user_id: RwLock<String>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Agent {
    /// Create an agent owning `conn`.
    #[must_use]
    pub fn new(
        conn: Arc<dyn Conn>,
        processor: Option<Arc<dyn Processor>>,
        learner: Arc<dyn AgentLearner>,
    ) -> Arc<Self> {
        Self::with_server_id(conn, processor, learner, String::new())
    }

    /// Create an agent whose sessions are stamped with `server_id`.
    #[must_use]
    pub fn with_server_id(
        conn: Arc<dyn Conn>,
        processor: Option<Arc<dyn Processor>>,
        learner: Arc<dyn AgentLearner>,
        server_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            processor,
            learner,
            server_id: server_id.into(),
            agent_id: AtomicI64::new(0),
            table_id: AtomicI64::new(0),
            user_data: Mutex::new(None),
            session: OnceLock::new(),
            user_id: RwLock::new(String::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Drive the receive loop until the connection fails, then tear down.
    pub async fn run(self: &Arc<Self>) {
        loop {
            let data = match self.conn.read_msg().await {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, "read message");
                    break;
                }
            };

            self.realize_session();
            if !self.connected.swap(true, Ordering::AcqRel) {
                self.learner.connect(self).await;
            }

            if let Some(processor) = &self.processor {
                let msg = match processor.unmarshal(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(session_id = ?self.session_id(), error = %e, "unmarshal message error");
                        break;
                    }
                };
                if let Err(e) = processor.route(msg, self) {
                    debug!(session_id = ?self.session_id(), error = %e, "route message error");
                    break;
                }
            }
        }

        self.conn.close();
        self.on_close().await;
    }

    fn realize_session(&self) {
        self.session.get_or_init(|| {
            let mut session = Session::new(
                self.conn.network(),
                self.conn.remote_addr().to_string(),
            );
            session.set_server_id(self.server_id.clone());
            LiveSession {
                id: session.session_id().to_string(),
                state: Arc::new(tokio::sync::Mutex::new(session)),
            }
        });
    }

    /// Mark the agent closed and notify the learner. Runs once.
    pub async fn on_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.learner.disconnect(self).await;
    }

    /// Encode `msg` with the processor and write it.
    ///
    /// Encode and write failures are logged and the message is dropped.
    pub fn write_msg<M: Message>(&self, msg: &M) {
        let Some(processor) = &self.processor else {
            return;
        };
        let frames = match processor.marshal(M::ID, msg) {
            Ok(frames) => frames,
            Err(e) => {
                error!(message = M::ID, error = %e, "marshal message error");
                return;
            }
        };
        if let Err(e) = self.conn.write_msg(frames) {
            error!(message = M::ID, error = %e, "write message error");
        }
    }

    /// Write pre-encoded frames, bypassing the processor.
    pub fn write_msg_bytes(&self, frames: Vec<Bytes>) {
        if let Err(e) = self.conn.write_msg(frames) {
            error!(error = %e, "write raw message error");
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Gracefully close the connection.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Forcefully drop the connection.
    pub fn destroy(&self) {
        self.conn.destroy();
    }

    #[must_use]
    pub fn user_data(&self) -> Option<UserData> {
        self.user_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_user_data(&self, data: UserData) {
        *self.user_data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
    }

    /// The live session, once the first message has been read.
    #[must_use]
    pub fn session(&self) -> Option<&SharedSession> {
        self.session.get().map(|s| &s.state)
    }

    /// Id of the live session, once the first message has been read.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session.get().map(|s| s.id.as_str())
    }

    /// A copy of the live session's current state.
    pub async fn session_snapshot(&self) -> Option<Session> {
        match self.session() {
            Some(state) => Some(state.lock().await.clone()),
            None => None,
        }
    }

    /// User id the session is bound to, empty when unbound.
    ///
    /// Readable without the session lock.
    #[must_use]
    pub fn user_id(&self) -> String {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_user_id(&self, user_id: &str) {
        user_id.clone_into(&mut self.user_id.write().unwrap_or_else(PoisonError::into_inner));
    }

    #[must_use]
    pub fn agent_id(&self) -> i64 {
        self.agent_id.load(Ordering::Relaxed)
    }

    pub fn set_agent_id(&self, id: i64) {
        self.agent_id.store(id, Ordering::Relaxed);
    }

    #[must_use]
    pub fn table_id(&self) -> i64 {
        self.table_id.load(Ordering::Relaxed)
    }

    pub fn set_table_id(&self, id: i64) {
        self.table_id.store(id, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
