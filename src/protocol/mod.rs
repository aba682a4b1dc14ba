use async_trait::async_trait;
use log::info;

mod resource;
mod scpi;
mod scpi_serial;
mod scpi_tcp;
mod stream;

pub use resource::Resource;
pub use scpi::ScpiProtocol;
pub use scpi_serial::ScpiSerialProtocol;
pub use scpi_tcp::ScpiTcpProtocol;

use crate::{config::SessionConfig, error::Result};

#[async_trait]
pub trait Protocol: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    /// Release the connection. Calling this on a closed transport is a
    /// no-op.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Address this transport talks to, for diagnostics
    fn resource(&self) -> String;
}

/// Build and connect the transport described by a resource string
pub async fn scpi_from_uri(uri: &str, config: &SessionConfig) -> Result<Box<dyn ScpiProtocol>> {
    let resource = Resource::parse(uri)?;

    let mut proto: Box<dyn ScpiProtocol> = match resource {
        Resource::Tcp { host, port } => Box::new(
            ScpiTcpProtocol::new(host, port)
                .with_connect_timeout(config.connect_timeout)
                .with_io_timeout(config.io_timeout),
        ),
        Resource::Serial { port, baud } => {
            Box::new(ScpiSerialProtocol::new(&port, baud).with_io_timeout(config.io_timeout))
        }
    };

    proto.connect().await?;
    info!("Connected to {}", proto.resource());

    Ok(proto)
}
