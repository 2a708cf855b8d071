//! TCP transport with length-prefixed framing.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use gate_core::{Conn, GateConfig, GateError, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::{Mutex, Semaphore, watch},
};
use tracing::{debug, info, warn};

use crate::{
    gate::AgentSpawner,
    queue::{Outgoing, WriteQueue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefixWidth {
    One,
    Two,
    Four,
}

/// Length-prefix framing: `[len][payload]`, where `len` counts payload
/// bytes only.
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    width: PrefixWidth,
    max_msg_len: u32,
    little_endian: bool,
}

impl Framing {
    /// # Errors
    /// Returns a config error if `len_msg_len` is not 1, 2 or 4.
    pub fn new(len_msg_len: usize, max_msg_len: u32, little_endian: bool) -> Result<Self> {
        let width = match len_msg_len {
            1 => PrefixWidth::One,
            2 => PrefixWidth::Two,
            4 => PrefixWidth::Four,
            n => {
                return Err(GateError::Config(format!(
                    "len_msg_len must be 1, 2 or 4, got {n}"
                )));
            }
        };
        Ok(Self {
            width,
            max_msg_len,
            little_endian,
        })
    }

    /// # Errors
    /// Returns a config error for an unsupported prefix width.
    pub fn from_config(config: &GateConfig) -> Result<Self> {
        Self::new(config.len_msg_len, config.max_msg_len, config.little_endian)
    }

    /// Read one frame's payload.
    ///
    /// # Errors
    /// Returns a transport error on I/O failure and a decode error for an
    /// empty or over-length frame.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = match (self.width, self.little_endian) {
            (PrefixWidth::One, _) => u32::from(reader.read_u8().await?),
            (PrefixWidth::Two, true) => u32::from(reader.read_u16_le().await?),
            (PrefixWidth::Two, false) => u32::from(reader.read_u16().await?),
            (PrefixWidth::Four, true) => reader.read_u32_le().await?,
            (PrefixWidth::Four, false) => reader.read_u32().await?,
        };
        if len == 0 {
            return Err(GateError::Decode("message too short".to_string()));
        }
        if len > self.max_msg_len {
            return Err(GateError::Decode(format!("message too long: {len} bytes")));
        }

        let mut payload = BytesMut::zeroed(len as usize);
        reader.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }

    /// Frame `parts` as one message under a single prefix.
    ///
    /// # Errors
    /// Returns an encode error if the joined payload exceeds `max_msg_len`.
    pub fn encode(&self, parts: &[Bytes]) -> Result<Bytes> {
        let total: usize = parts.iter().map(Bytes::len).sum();
        let too_long = || GateError::Encode(format!("message too long: {total} bytes"));
        let len = u32::try_from(total)
            .ok()
            .filter(|len| *len <= self.max_msg_len)
            .ok_or_else(too_long)?;

        let mut buf = BytesMut::with_capacity(4 + total);
        match self.width {
            PrefixWidth::One => buf.put_u8(u8::try_from(len).map_err(|_| too_long())?),
            PrefixWidth::Two => {
                let len = u16::try_from(len).map_err(|_| too_long())?;
                if self.little_endian {
                    buf.put_u16_le(len);
                } else {
                    buf.put_u16(len);
                }
            }
            PrefixWidth::Four => {
                if self.little_endian {
                    buf.put_u32_le(len);
                } else {
                    buf.put_u32(len);
                }
            }
        }
        for part in parts {
            buf.put_slice(part);
        }
        Ok(buf.freeze())
    }
}

/// A framed TCP connection.
pub struct TcpConn {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    queue: WriteQueue,
    framing: Framing,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TcpConn {
    /// Split `stream` and start its writer task.
    ///
    /// # Errors
    /// Returns error if the socket addresses cannot be read.
    pub fn spawn(stream: TcpStream, framing: Framing, pending_write_num: usize) -> io::Result<Arc<Self>> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();

        let queue = WriteQueue::spawn(pending_write_num, move |mut rx| async move {
            while let Some(Outgoing::Frame(frame)) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(%remote, error = %e, "tcp write error");
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Ok(Arc::new(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            queue,
            framing,
            local,
            remote,
        }))
    }
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_msg(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        self.queue
            .guard_read(self.framing.read_frame(&mut *reader))
            .await
    }

    fn write_msg(&self, frames: Vec<Bytes>) -> Result<()> {
        let frame = self.framing.encode(&frames)?;
        self.queue.push(frame)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn network(&self) -> &'static str {
        "tcp"
    }

    fn close(&self) {
        self.queue.close();
    }

    fn destroy(&self) {
        self.queue.destroy();
    }
}

/// Accept loop. Each accepted socket becomes an agent while a connection
/// slot is free; extra sockets are dropped.
pub(crate) async fn serve(
    listener: TcpListener,
    framing: Framing,
    pending_write_num: usize,
    slots: Arc<Semaphore>,
    spawner: AgentSpawner,
    mut stop: watch::Receiver<bool>,
) {
    let mut delay = Duration::ZERO;
    loop {
        let (stream, addr) = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    delay = if delay.is_zero() {
                        Duration::from_millis(5)
                    } else {
                        (delay * 2).min(Duration::from_secs(1))
                    };
                    warn!(error = %e, retry_in = ?delay, "tcp accept error");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            },
        };
        delay = Duration::ZERO;

        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            warn!(%addr, "too many connections");
            continue;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "set_nodelay failed");
        }
        let conn = match TcpConn::spawn(stream, framing, pending_write_num) {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%addr, error = %e, "tcp connection setup failed");
                continue;
            }
        };

        let spawner = spawner.clone();
        tokio::spawn(async move {
            spawner.run(conn).await;
            drop(permit);
        });
    }
    info!("tcp listener stopped");
}
