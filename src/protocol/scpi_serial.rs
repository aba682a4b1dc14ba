use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::{
    config::DEFAULT_IO_TIMEOUT,
    error::{Error, Result},
};

use super::{Protocol, ScpiProtocol, stream::ScpiStream};

pub struct ScpiSerialProtocol {
    port: String,
    baud: u32,
    io_timeout: Duration,
    serial: Option<ScpiStream<SerialStream>>,
}
impl ScpiSerialProtocol {
    pub fn new(port: &str, baud: u32) -> Self {
        Self {
            port: port.to_string(),
            baud,
            io_timeout: DEFAULT_IO_TIMEOUT,
            serial: None,
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}
#[async_trait]
impl Protocol for ScpiSerialProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.serial.is_some() {
            return Err(Error::Connection("Already connected".into()));
        }

        debug!(port = self.port.as_str(), baud = self.baud; "opening serial port");

        let serial = tokio_serial::new(&self.port, self.baud)
            .open_native_async()
            .map_err(|e| Error::Connection(format!("Could not open {}: {e}", self.port)))?;
        self.serial = Some(ScpiStream::new(serial));

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.serial.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.serial.is_some()
    }

    fn resource(&self) -> String {
        format!("serial:{}?baud={}", self.port, self.baud)
    }
}
#[async_trait]
impl ScpiProtocol for ScpiSerialProtocol {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotConnected);
        };

        serial.send(data, self.io_timeout).await
    }

    async fn int_recv(&mut self) -> Result<Vec<u8>> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotConnected);
        };

        serial.recv_until(b'\n', self.io_timeout).await
    }

    async fn recv_raw(&mut self, length: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotConnected);
        };

        serial
            .recv_raw(length, timeout.unwrap_or(self.io_timeout))
            .await
    }

    async fn recv_until(&mut self, byte: u8, timeout: Duration) -> Result<Vec<u8>> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotConnected);
        };

        serial.recv_until(byte, timeout).await
    }

    async fn flush_rx(&mut self, timeout: Duration) -> Result<()> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotConnected);
        };

        debug!("flush_rx({timeout:?})");
        serial.flush_rx(timeout).await?;
        Ok(())
    }

    fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }
}
