use std::time::Duration;

use log::warn;

use crate::{
    block::BinFloatFormat,
    error::{Error, Result},
};

/// Default read/write timeout of a single transport operation
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time allowed for an OPC-synchronised operation
pub const DEFAULT_OPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bulk transfer chunk, 100 kB
pub const DEFAULT_DATA_CHUNK_SIZE: usize = 100_000;

/// Settings applied to a session when it is opened. All of them can be
/// changed afterwards through the session's setters.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub opc_timeout: Duration,
    /// Drain the instrument error queue after every write/query
    pub status_checking: bool,
    /// Synchronise every plain write with `*OPC?`
    pub opc_query_after_write: bool,
    pub bin_float_format: BinFloatFormat,
    pub data_chunk_size: usize,
    /// Query `*IDN?` right after connecting
    pub id_query: bool,
    /// Send `*RST` and `*CLS` right after connecting
    pub reset: bool,
}
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            opc_timeout: DEFAULT_OPC_TIMEOUT,
            status_checking: true,
            opc_query_after_write: false,
            bin_float_format: BinFloatFormat::default(),
            data_chunk_size: DEFAULT_DATA_CHUNK_SIZE,
            id_query: false,
            reset: false,
        }
    }
}
impl SessionConfig {
    /// Parse a driver options string, e.g.
    /// `"VisaTimeout=3000, OpcTimeout=15000, QueryInstrumentStatus=False"`.
    /// Keys not understood here are logged and skipped.
    pub fn from_options(options: &str) -> Result<Self> {
        let mut config = Self::default();

        for item in options.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }

            let Some((key, value)) = item.split_once('=') else {
                return Err(Error::InvalidArgument(format!(
                    "Option `{item}` is not of the form Key=Value"
                )));
            };
            let key = key.trim();
            let value = value.trim().trim_matches('\'').trim_matches('"');

            match key.to_ascii_lowercase().as_str() {
                "connecttimeout" => config.connect_timeout = parse_millis(key, value)?,
                "visatimeout" | "iotimeout" => config.io_timeout = parse_millis(key, value)?,
                "opctimeout" => config.opc_timeout = parse_millis(key, value)?,
                "queryinstrumentstatus" => config.status_checking = parse_bool(key, value)?,
                "opcqueryafterwrite" => config.opc_query_after_write = parse_bool(key, value)?,
                "idquery" => config.id_query = parse_bool(key, value)?,
                "reset" => config.reset = parse_bool(key, value)?,
                "binfloatformat" => {
                    config.bin_float_format = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("Unknown float format `{value}`"))
                    })?
                }
                "datachunksize" => {
                    let size: usize = value.parse().map_err(|e| {
                        Error::InvalidArgument(format!("Bad value for {key} `{value}`: {e}"))
                    })?;
                    config = config.with_data_chunk_size(size)?;
                }
                _ => warn!("Ignoring unsupported option `{key}`"),
            }
        }

        Ok(config)
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_opc_timeout(mut self, timeout: Duration) -> Self {
        self.opc_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_status_checking(mut self, enabled: bool) -> Self {
        self.status_checking = enabled;
        self
    }

    pub fn with_opc_query_after_write(mut self, enabled: bool) -> Self {
        self.opc_query_after_write = enabled;
        self
    }

    pub fn with_bin_float_format(mut self, format: BinFloatFormat) -> Self {
        self.bin_float_format = format;
        self
    }

    pub fn with_data_chunk_size(mut self, size: usize) -> Result<Self> {
        self.data_chunk_size = check_chunk_size(size)?;
        Ok(self)
    }

    pub fn with_id_query(mut self, enabled: bool) -> Self {
        self.id_query = enabled;
        self
    }

    pub fn with_reset(mut self, enabled: bool) -> Self {
        self.reset = enabled;
        self
    }
}

pub(crate) fn check_chunk_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::InvalidArgument("Chunk size must be non-zero".into()));
    }
    Ok(size)
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .parse()
        .map(Duration::from_millis)
        .map_err(|e| Error::InvalidArgument(format!("Bad value for {key} `{value}`: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "Bad value for {key} `{value}`, expected a boolean"
        ))),
    }
}
