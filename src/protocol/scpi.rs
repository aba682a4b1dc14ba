use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::error::Result;

use super::{Protocol, stream::printable};

/// Byte-level conversation with one instrument. Implementations own their
/// connection exclusively; everything above this trait goes through it.
#[async_trait]
pub trait ScpiProtocol: Protocol + Send + Sync {
    /// Write raw bytes, bounded by the I/O timeout
    async fn int_send(&mut self, data: &[u8]) -> Result<()>;

    /// Read one newline-terminated message, bounded by the I/O timeout
    async fn int_recv(&mut self) -> Result<Vec<u8>>;

    async fn int_query(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.int_send(data).await?;
        self.int_recv().await
    }

    /// Read exactly `length` bytes. `None` uses the I/O timeout.
    async fn recv_raw(&mut self, length: usize, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Read up to and including `byte`
    async fn recv_until(&mut self, byte: u8, timeout: Duration) -> Result<Vec<u8>>;

    /// Drop any pending input, waiting at most `timeout` for more
    async fn flush_rx(&mut self, timeout: Duration) -> Result<()>;

    fn io_timeout(&self) -> Duration;

    fn set_io_timeout(&mut self, timeout: Duration);
}
impl dyn ScpiProtocol {
    pub async fn send(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        debug!("send: {}", printable(data));

        let mut to_send = Vec::with_capacity(data.len() + 1);
        to_send.extend_from_slice(data);
        to_send.push(b'\n');
        self.int_send(&to_send).await
    }

    pub async fn query(&mut self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.send(data).await?;
        self.recv().await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let resp = self.int_recv().await?;
        debug!("recv: {}", printable(&resp));
        Ok(resp)
    }

    pub async fn identify(&mut self) -> Result<String> {
        let res = self.query("*IDN?").await?;

        Ok(String::from_utf8_lossy(&res).trim().into())
    }
}
