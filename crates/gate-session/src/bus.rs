//! Typed request bus in front of the session directory.
//!
//! Backend workers hold a cloneable [`DirectoryBus`] and never touch
//! sockets. Each request is served on its own task, so requests for
//! different sessions run concurrently; requests for the same session are
//! serialized by that session's lock.

use std::sync::Arc;

use bytes::Bytes;
use gate_core::{GateError, Result, Session, Settings};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::SessionDirectory;

/// Channel capacity for directory requests.
const BUS_CAPACITY: usize = 1024;

/// One remote-control operation, with its reply channel.
pub enum DirectoryRequest {
    Update {
        session_id: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    Bind {
        session_id: String,
        user_id: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    UnBind {
        session_id: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    Push {
        session_id: String,
        settings: Settings,
        reply: oneshot::Sender<Result<Session>>,
    },
    Set {
        session_id: String,
        key: String,
        value: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    Remove {
        session_id: String,
        key: String,
        reply: oneshot::Sender<Result<Session>>,
    },
    Send {
        session_id: String,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Fire-and-forget send; nothing is reported back.
    SendNR { session_id: String, data: Bytes },
    SendBatch {
        session_ids: String,
        data: Bytes,
        reply: oneshot::Sender<usize>,
    },
    BroadCast {
        data: Bytes,
        reply: oneshot::Sender<usize>,
    },
    IsConnect {
        /// The asking session; lookup is by `user_id` alone.
        session_id: String,
        user_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Close {
        session_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Heartbeat { user_id: String },
    Evict {
        user_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

async fn dispatch(directory: Arc<SessionDirectory>, request: DirectoryRequest) {
    // Callers that stopped waiting are not an error.
    match request {
        DirectoryRequest::Update { session_id, reply } => {
            let _ = reply.send(directory.update(&session_id).await);
        }
        DirectoryRequest::Bind {
            session_id,
            user_id,
            reply,
        } => {
            let _ = reply.send(directory.bind(&session_id, &user_id).await);
        }
        DirectoryRequest::UnBind { session_id, reply } => {
            let _ = reply.send(directory.unbind(&session_id).await);
        }
        DirectoryRequest::Push {
            session_id,
            settings,
            reply,
        } => {
            let _ = reply.send(directory.push(&session_id, settings).await);
        }
        DirectoryRequest::Set {
            session_id,
            key,
            value,
            reply,
        } => {
            let _ = reply.send(directory.set(&session_id, &key, &value).await);
        }
        DirectoryRequest::Remove {
            session_id,
            key,
            reply,
        } => {
            let _ = reply.send(directory.remove(&session_id, &key).await);
        }
        DirectoryRequest::Send {
            session_id,
            data,
            reply,
        } => {
            let _ = reply.send(directory.send(&session_id, data));
        }
        DirectoryRequest::SendNR { session_id, data } => {
            if let Err(e) = directory.send(&session_id, data) {
                debug!(session_id, error = %e, "send without reply failed");
            }
        }
        DirectoryRequest::SendBatch {
            session_ids,
            data,
            reply,
        } => {
            let _ = reply.send(directory.send_batch(&session_ids, &data));
        }
        DirectoryRequest::BroadCast { data, reply } => {
            let _ = reply.send(directory.broadcast(&data));
        }
        DirectoryRequest::IsConnect {
            session_id: _,
            user_id,
            reply,
        } => {
            let _ = reply.send(directory.is_connect(&user_id));
        }
        DirectoryRequest::Close { session_id, reply } => {
            let _ = reply.send(directory.close(&session_id));
        }
        DirectoryRequest::Heartbeat { user_id } => {
            directory.heartbeat(&user_id).await;
        }
        DirectoryRequest::Evict { user_id, reply } => {
            let _ = reply.send(directory.evict(&user_id).await);
        }
    }
}

/// Client handle for the directory bus. Cheap to clone.
#[derive(Clone)]
pub struct DirectoryBus {
    tx: mpsc::Sender<DirectoryRequest>,
}

impl DirectoryBus {
    /// Start serving `directory` and return the client handle.
    ///
    /// The serving task ends once every handle has been dropped.
    #[must_use]
    pub fn spawn(directory: Arc<SessionDirectory>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DirectoryRequest>(BUS_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                tokio::spawn(dispatch(Arc::clone(&directory), request));
            }
            debug!("directory bus stopped");
        });

        (Self { tx }, task)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DirectoryRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| GateError::BusClosed)?;
        rx.await.map_err(|_| GateError::BusClosed)
    }

    async fn cast(&self, request: DirectoryRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| GateError::BusClosed)
    }

    /// See [`SessionDirectory::update`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn update(&self, session_id: &str) -> Result<Session> {
        self.call(|reply| DirectoryRequest::Update {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::bind`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn bind(&self, session_id: &str, user_id: &str) -> Result<Session> {
        self.call(|reply| DirectoryRequest::Bind {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::unbind`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn unbind(&self, session_id: &str) -> Result<Session> {
        self.call(|reply| DirectoryRequest::UnBind {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::push`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn push(&self, session_id: &str, settings: Settings) -> Result<Session> {
        self.call(|reply| DirectoryRequest::Push {
            session_id: session_id.to_string(),
            settings,
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::set`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn set(&self, session_id: &str, key: &str, value: &str) -> Result<Session> {
        self.call(|reply| DirectoryRequest::Set {
            session_id: session_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::remove`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn remove(&self, session_id: &str, key: &str) -> Result<Session> {
        self.call(|reply| DirectoryRequest::Remove {
            session_id: session_id.to_string(),
            key: key.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::send`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn send(&self, session_id: &str, data: Bytes) -> Result<()> {
        self.call(|reply| DirectoryRequest::Send {
            session_id: session_id.to_string(),
            data,
            reply,
        })
        .await?
    }

    /// Send without waiting for the directory.
    ///
    /// # Errors
    /// Returns bus-closed if the request could not be queued.
    pub async fn send_nr(&self, session_id: &str, data: Bytes) -> Result<()> {
        self.cast(DirectoryRequest::SendNR {
            session_id: session_id.to_string(),
            data,
        })
        .await
    }

    /// See [`SessionDirectory::send_batch`].
    ///
    /// # Errors
    /// Returns bus-closed.
    pub async fn send_batch(&self, session_ids: &str, data: Bytes) -> Result<usize> {
        self.call(|reply| DirectoryRequest::SendBatch {
            session_ids: session_ids.to_string(),
            data,
            reply,
        })
        .await
    }

    /// See [`SessionDirectory::broadcast`].
    ///
    /// # Errors
    /// Returns bus-closed.
    pub async fn broadcast(&self, data: Bytes) -> Result<usize> {
        self.call(|reply| DirectoryRequest::BroadCast { data, reply })
            .await
    }

    /// See [`SessionDirectory::is_connect`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn is_connect(&self, session_id: &str, user_id: &str) -> Result<bool> {
        self.call(|reply| DirectoryRequest::IsConnect {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::close`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        self.call(|reply| DirectoryRequest::Close {
            session_id: session_id.to_string(),
            reply,
        })
        .await?
    }

    /// See [`SessionDirectory::heartbeat`].
    ///
    /// # Errors
    /// Returns bus-closed if the request could not be queued.
    pub async fn heartbeat(&self, user_id: &str) -> Result<()> {
        self.cast(DirectoryRequest::Heartbeat {
            user_id: user_id.to_string(),
        })
        .await
    }

    /// See [`SessionDirectory::evict`].
    ///
    /// # Errors
    /// Returns the directory's error, or bus-closed.
    pub async fn evict(&self, user_id: &str) -> Result<()> {
        self.call(|reply| DirectoryRequest::Evict {
            user_id: user_id.to_string(),
            reply,
        })
        .await?
    }
}
