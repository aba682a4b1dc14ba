use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;

use crate::{
    config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT},
    error::{Error, Result},
};

use super::{Protocol, ScpiProtocol, stream::ScpiStream};

/// SCPI over a raw TCP socket (usually port 5025)
pub struct ScpiTcpProtocol {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<ScpiStream<TcpStream>>,
}
impl ScpiTcpProtocol {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            stream: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}
#[async_trait]
impl Protocol for ScpiTcpProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Connection("Already connected".into()));
        }

        debug!(host = self.host.as_str(), port = self.port; "connecting");

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(Error::Connection(format!(
                    "Timed out connecting to {} after {} ms",
                    self.resource(),
                    self.connect_timeout.as_millis()
                )));
            }
            Ok(Err(e)) => {
                return Err(Error::Connection(format!(
                    "Could not connect to {}: {e}",
                    self.resource()
                )));
            }
            Ok(Ok(stream)) => stream,
        };
        /* Commands are small and latency bound */
        stream.set_nodelay(true)?;

        self.stream = Some(ScpiStream::new(stream));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("Disconnected from {}", self.resource());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn resource(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}
#[async_trait]
impl ScpiProtocol for ScpiTcpProtocol {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        stream.send(data, self.io_timeout).await
    }

    async fn int_recv(&mut self) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        stream.recv_until(b'\n', self.io_timeout).await
    }

    async fn recv_raw(&mut self, length: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        stream
            .recv_raw(length, timeout.unwrap_or(self.io_timeout))
            .await
    }

    async fn recv_until(&mut self, byte: u8, timeout: Duration) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        stream.recv_until(byte, timeout).await
    }

    async fn flush_rx(&mut self, timeout: Duration) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        stream.flush_rx(timeout).await?;
        Ok(())
    }

    fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }
}
