//! Socket adapter shared by both ends of the proxy: reads with a deadline,
//! writes through an asynchronous queue drained by a pump task, and close
//! propagation through a cancellation token.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A blocking byte producer feeding a [`crate::mxpeg::RingBuffer`].
#[async_trait]
pub trait ByteSource: Send {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A TCP connection with a per-read deadline and a non-blocking write queue.
///
/// The writer side can be cloned and handed around freely; the reading side
/// stays with the owner. Closing (from either side, or by cancelling the
/// parent token) makes all further reads fail and stops the write pump.
pub struct Stream {
    read_half: OwnedReadHalf,
    read_timeout: Duration,
    writer: StreamWriter,
}

/// Cloneable write handle of a [`Stream`]. Writes never block; they are
/// queued and drained by the pump task with a per-write deadline.
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    token: CancellationToken,
}

impl Stream {
    /// Dial `addr` with a connect timeout.
    pub async fn connect(
        parent: &CancellationToken,
        addr: &str,
        timeout: Duration,
    ) -> io::Result<Stream> {
        let conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        Ok(Self::new(parent, conn))
    }

    pub fn new(parent: &CancellationToken, conn: TcpStream) -> Stream {
        let token = parent.child_token();
        let (read_half, mut write_half) = conn.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let pump_token = token.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = pump_token.cancelled() => {
                        // flush whatever is already queued before tearing down
                        while let Ok(data) = rx.try_recv() {
                            match tokio::time::timeout(WRITE_TIMEOUT, write_half.write_all(&data))
                                .await
                            {
                                Ok(Ok(())) => {}
                                _ => break,
                            }
                        }
                        break;
                    }
                    data = rx.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };

                match tokio::time::timeout(WRITE_TIMEOUT, write_half.write_all(&data)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "error writing data");
                        pump_token.cancel();
                        break;
                    }
                    Err(_) => {
                        warn!("write timed out");
                        pump_token.cancel();
                        break;
                    }
                }
            }
            debug!("finished write pump");
        });

        Stream {
            read_half,
            read_timeout: DEFAULT_READ_TIMEOUT,
            writer: StreamWriter { tx, token },
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn writer(&self) -> StreamWriter {
        self.writer.clone()
    }
}

#[async_trait]
impl ByteSource for Stream {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.writer.token.is_cancelled() {
            return Err(closed());
        }

        tokio::select! {
            _ = self.writer.token.cancelled() => Err(closed()),
            r = tokio::time::timeout(self.read_timeout, self.read_half.read(buf)) => {
                r.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
            }
        }
    }
}

impl StreamWriter {
    /// Queue `data` for sending. Errors are ignored; writing to a closed
    /// stream drops the data.
    pub fn write(&self, data: impl Into<Bytes>) {
        let _ = self.tx.send(data.into());
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream closed")
}

#[cfg(test)]
#[async_trait]
impl ByteSource for std::io::Cursor<Vec<u8>> {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::io::Read::read(self, buf)
    }
}
