//! Bounded per-connection write queue shared by the socket transports.

use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use gate_core::{GateError, Result};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::warn;

/// An item for the writer task.
pub(crate) enum Outgoing {
    Frame(Bytes),
    /// Flush everything queued before this, then stop.
    Close,
}

/// Queue between `write_msg` callers and the connection's writer task.
///
/// A full queue means the peer is not reading; the connection is destroyed
/// rather than blocking the caller.
pub(crate) struct WriteQueue {
    tx: mpsc::Sender<Outgoing>,
    closing: AtomicBool,
    shutdown: Arc<watch::Sender<bool>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Spawn the writer task. `drive` owns the socket's write side and
    /// returns once it sees [`Outgoing::Close`], the channel closes, or a
    /// write fails.
    pub(crate) fn spawn<F, Fut>(capacity: usize, drive: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<Outgoing>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let writing = drive(rx);
        let writer = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move {
                writing.await;
                shutdown.send_replace(true);
            }
        });

        Self {
            tx,
            closing: AtomicBool::new(false),
            shutdown,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub(crate) fn is_shut(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Queue one encoded message.
    pub(crate) fn push(&self, frame: Bytes) -> Result<()> {
        if self.closing.load(Ordering::Acquire) || self.is_shut() {
            return Err(GateError::Transport("connection closed".to_string()));
        }
        match self.tx.try_send(Outgoing::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("write queue full, dropping slow connection");
                self.destroy();
                Err(GateError::Transport("write queue full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GateError::Transport("connection closed".to_string()))
            }
        }
    }

    /// Flush queued writes, then stop the writer. Idempotent.
    pub(crate) fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.tx.try_send(Outgoing::Close).is_err() {
            self.destroy();
        }
    }

    /// Stop immediately, discarding queued writes.
    pub(crate) fn destroy(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            writer.abort();
        }
    }

    /// Run `read`, failing early once the queue has shut down.
    pub(crate) async fn guard_read<T, F>(&self, read: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(GateError::Transport("connection closed".to_string()));
        }
        tokio::select! {
            result = read => result,
            _ = shutdown.changed() => Err(GateError::Transport("connection closed".to_string())),
        }
    }
}
