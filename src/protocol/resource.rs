use crate::error::{Error, Result};

/// Default baud rate for serial resources that do not name one
pub const DEFAULT_BAUD: u32 = 9600;

/// Parsed instrument address
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// SCPI over a raw TCP socket
    Tcp { host: String, port: u16 },
    /// SCPI over a serial port
    Serial { port: String, baud: u32 },
}
impl Resource {
    /// Accepts `tcp://host:port`, `serial:<port>[?baud=<baud>]`, and the
    /// VISA forms `TCPIP[n]::<host>::<port>::SOCKET` and `ASRL<port>::INSTR`.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        if let Some(rest) = uri.strip_prefix("tcp://") {
            let Some((host, port)) = rest.rsplit_once(':') else {
                return Err(Error::Connection(format!("Missing port in `{uri}`")));
            };
            return Ok(Self::Tcp {
                host: strip_brackets(host).to_string(),
                port: parse_port(uri, port)?,
            });
        }

        if let Some(rest) = uri.strip_prefix("serial:") {
            let (port, baud) = match rest.split_once("?baud=") {
                Some((port, baud)) => (
                    port,
                    baud.parse()
                        .map_err(|_| Error::Connection(format!("Bad baud rate in `{uri}`")))?,
                ),
                None => (rest, DEFAULT_BAUD),
            };
            if port.is_empty() {
                return Err(Error::Connection(format!("Missing serial port in `{uri}`")));
            }
            return Ok(Self::Serial {
                port: port.to_string(),
                baud,
            });
        }

        Self::parse_visa(uri)
    }

    fn parse_visa(uri: &str) -> Result<Self> {
        let parts: Vec<_> = uri.split("::").collect();
        let interface = parts[0].to_ascii_uppercase();

        if interface.starts_with("TCPIP") {
            let suffix = parts.last().map(|p| p.to_ascii_uppercase());
            return match (parts.len(), suffix.as_deref()) {
                (4, Some("SOCKET")) => Ok(Self::Tcp {
                    host: parts[1].to_string(),
                    port: parse_port(uri, parts[2])?,
                }),
                _ => Err(Error::NotSupported(format!(
                    "Only raw socket TCPIP resources are supported, got `{uri}`"
                ))),
            };
        }

        if let Some(port) = interface.strip_prefix("ASRL") {
            if parts.len() == 2 && !port.is_empty() {
                /* Keep the original case, device paths are case sensitive */
                return Ok(Self::Serial {
                    port: parts[0][4..].to_string(),
                    baud: DEFAULT_BAUD,
                });
            }
        }

        Err(Error::Connection(format!("Unrecognised resource `{uri}`")))
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn parse_port(uri: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::Connection(format!("Bad port `{port}` in `{uri}`")))
}
