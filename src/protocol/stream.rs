use std::time::Duration;

use log::trace;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Receive buffer size used when wrapping a byte stream
const BUFFER_SIZE: usize = 64 * 1024;

/// Render control characters visibly for logging
pub(crate) fn printable(data: &[u8]) -> String {
    const MAX_LOG: usize = 128;

    let mut out = String::from_utf8_lossy(&data[..data.len().min(MAX_LOG)])
        .replace('\n', "␤")
        .replace('\r', "␊");
    if data.len() > MAX_LOG {
        out.push_str(&format!("... ({} bytes)", data.len()));
    }
    out
}

/// Buffered byte stream with per-operation timeouts, shared by every
/// stream-based transport. The reader is kept for the lifetime of the
/// connection so bytes buffered past a terminator are never dropped.
pub(crate) struct ScpiStream<S> {
    inner: BufReader<S>,
}
impl<S> ScpiStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_SIZE, inner),
        }
    }

    pub async fn send(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        trace!("send: {}", printable(data));

        let write = async {
            self.inner.get_mut().write_all(data).await?;
            self.inner.get_mut().flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Err(_) => Err(Error::IoTimeout {
                command: None,
                timeout,
                detail: format!("writing {} bytes", data.len()),
            }),
            Ok(res) => Ok(res?),
        }
    }

    pub async fn recv_raw(&mut self, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut resp = vec![0; length];

        match tokio::time::timeout(timeout, self.inner.read_exact(&mut resp)).await {
            Err(_) => {
                return Err(Error::IoTimeout {
                    command: None,
                    timeout,
                    detail: format!("reading {length} bytes"),
                });
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Connection("Connection closed by instrument".into()));
            }
            Ok(res) => {
                res?;
            }
        }

        trace!("recv_raw: {}", printable(&resp));
        Ok(resp)
    }

    pub async fn recv_until(&mut self, byte: u8, timeout: Duration) -> Result<Vec<u8>> {
        let mut data = vec![];

        match tokio::time::timeout(timeout, self.inner.read_until(byte, &mut data)).await {
            Err(_) => {
                return Err(Error::IoTimeout {
                    command: None,
                    timeout,
                    detail: format!("waiting for `{}`", byte.escape_ascii()),
                });
            }
            Ok(res) => {
                res?;
            }
        }

        if data.last() != Some(&byte) {
            return Err(Error::Connection("Connection closed by instrument".into()));
        }

        trace!("recv_until: {}", printable(&data));
        Ok(data)
    }

    /// Discard anything received until the line stays quiet for `timeout`
    pub async fn flush_rx(&mut self, timeout: Duration) -> Result<usize> {
        let mut discarded = 0;

        loop {
            let buffered = self.inner.buffer().len();
            if buffered > 0 {
                self.inner.consume(buffered);
                discarded += buffered;
                continue;
            }

            match tokio::time::timeout(timeout, self.inner.fill_buf()).await {
                Err(_) => break,
                Ok(res) => {
                    if res?.is_empty() {
                        break;
                    }
                }
            }
        }

        if discarded > 0 {
            trace!("flush_rx: discarded {discarded} bytes");
        }
        Ok(discarded)
    }
}
