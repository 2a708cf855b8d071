//! WebSocket transport served by axum.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::{Bytes, BytesMut};
use futures::{
    SinkExt, StreamExt,
    stream::SplitStream,
};
use gate_core::{Conn, GateError, Result};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Semaphore, watch},
};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    gate::AgentSpawner,
    queue::{Outgoing, WriteQueue},
};

/// Listener settings shared by every upgrade.
#[derive(Clone)]
pub(crate) struct WsState {
    pub(crate) spawner: AgentSpawner,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) local: SocketAddr,
    pub(crate) max_msg_len: usize,
    pub(crate) pending_write_num: usize,
}

/// A WebSocket connection. Text and binary frames are both read as
/// message payloads; writes go out as binary frames.
pub struct WsConn {
    stream: Mutex<SplitStream<WebSocket>>,
    queue: WriteQueue,
    max_msg_len: usize,
    local: SocketAddr,
    remote: SocketAddr,
}

impl WsConn {
    fn spawn(
        socket: WebSocket,
        local: SocketAddr,
        remote: SocketAddr,
        max_msg_len: usize,
        pending_write_num: usize,
    ) -> Arc<Self> {
        let (mut sink, stream) = socket.split();

        let queue = WriteQueue::spawn(pending_write_num, move |mut rx| async move {
            while let Some(Outgoing::Frame(frame)) = rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    debug!(%remote, error = %e, "websocket write error");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        Arc::new(Self {
            stream: Mutex::new(stream),
            queue,
            max_msg_len,
            local,
            remote,
        })
    }
}

async fn next_payload(stream: &mut SplitStream<WebSocket>, max_msg_len: usize) -> Result<Bytes> {
    loop {
        let payload = match stream.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(GateError::Transport("websocket closed".to_string()));
            }
            Some(Err(e)) => return Err(GateError::Transport(e.to_string())),
        };
        if payload.len() > max_msg_len {
            return Err(GateError::Decode(format!(
                "message too long: {} bytes",
                payload.len()
            )));
        }
        return Ok(payload);
    }
}

#[async_trait]
impl Conn for WsConn {
    async fn read_msg(&self) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        self.queue
            .guard_read(next_payload(&mut stream, self.max_msg_len))
            .await
    }

    fn write_msg(&self, frames: Vec<Bytes>) -> Result<()> {
        let total: usize = frames.iter().map(Bytes::len).sum();
        if total > self.max_msg_len {
            return Err(GateError::Encode(format!("message too long: {total} bytes")));
        }
        let frame = match <[Bytes; 1]>::try_from(frames) {
            Ok([frame]) => frame,
            Err(frames) => {
                let mut joined = BytesMut::with_capacity(total);
                for part in &frames {
                    joined.extend_from_slice(part);
                }
                joined.freeze()
            }
        };
        self.queue.push(frame)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn network(&self) -> &'static str {
        "ws"
    }

    fn close(&self) {
        self.queue.close();
    }

    fn destroy(&self) {
        self.queue.destroy();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(%remote, "too many connections");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.max_message_size(state.max_msg_len)
        .on_upgrade(move |socket| async move {
            let conn = WsConn::spawn(
                socket,
                state.local,
                remote,
                state.max_msg_len,
                state.pending_write_num,
            );
            state.spawner.run(conn).await;
            drop(permit);
        })
}

/// Router serving upgrades at `/`.
pub(crate) fn router(state: WsState, http_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    http_timeout,
                )),
        )
        .with_state(state)
}

/// Serve WebSocket upgrades on `listener` until `stop` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    state: WsState,
    http_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let app = router(state, http_timeout);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = stop.changed().await;
    })
    .await;

    if let Err(e) = served {
        warn!(error = %e, "websocket listener failed");
    }
    info!("websocket listener stopped");
}
