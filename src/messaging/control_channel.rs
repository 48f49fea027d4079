use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connector::sockets::SocketGuard;

/// Writes a single frame: a u32 big endian length prefix followed by the body
pub async fn write_frame(w: &mut (impl AsyncWrite + Unpin), body: &[u8], max_len: usize) -> anyhow::Result<()> {
    if body.is_empty() || body.len() > max_len {
        bail!("control frame length {} is out of range 1..={}", body.len(), max_len);
    }

    w.write_all((body.len() as u32).to_be_bytes().as_ref()).await?;
    w.write_all(body).await?;
    Ok(())
}

/// Reads a single frame, returning `None` if the peer closed the connection between frames
pub async fn read_frame(r: &mut (impl AsyncRead + Unpin), max_len: usize) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_len {
        bail!("received a control frame with length {} outside of 1..={} - closing the channel because it is apparently compromised", len, max_len);
    }

    let mut body = BytesMut::zeroed(len);
    r.read_exact(&mut body).await?;
    Ok(Some(body.freeze()))
}

/// The sending side of a control channel. Frames are written by a dedicated task in the order
///  they were sent, so sending never blocks and can happen while holding a lock.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<Bytes>,
}
impl ControlSender {
    pub fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.tx.send(frame).is_err() {
            bail!("control channel is closed");
        }
        Ok(())
    }
}

pub struct ControlReceiver {
    read: OwnedReadHalf,
    max_len: usize,
}
impl ControlReceiver {
    pub async fn next(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.read, self.max_len).await
    }
}

/// Splits a connected control socket. The writer task exits when `cancel` fires, after writing
///  frames that were already queued, or when all senders are dropped.
pub fn open_control_channel(stream: TcpStream, guard: SocketGuard, max_len: usize, cancel: CancellationToken) -> (ControlSender, ControlReceiver) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write_frame(&mut write, &frame, max_len).await {
                            debug!("error writing control frame: {}", e);
                            return;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(frame) = rx.try_recv() {
                        if write_frame(&mut write, &frame, max_len).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        trace!("control channel writer terminated");
        let _ = write.shutdown().await;
    });

    (ControlSender { tx }, ControlReceiver { read, max_len })
}
