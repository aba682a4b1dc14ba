use std::{fmt::Display, result, time::Duration};

pub type Result<T, E = Error> = result::Result<T, E>;

/// One entry of the instrument's error queue, as reported by `SYST:ERR?`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: i32,
    pub message: String,
}
impl ErrorEntry {
    /// Parse a `<code>,"<message>"` error queue response
    pub fn from_response(resp: &str) -> Result<Self> {
        let resp = resp.trim();
        let (code, message) = match resp.split_once(',') {
            Some((code, message)) => (code, message),
            None => (resp, ""),
        };

        let code = code
            .trim()
            .parse()
            .map_err(|e| Error::Decode(format!("Bad error queue response `{resp}`: {e}")))?;

        Ok(Self {
            code,
            message: message
                .trim()
                .trim_start_matches('"')
                .trim_end_matches('"')
                .to_string(),
        })
    }

    /// Code 0 marks an empty queue
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}
impl Display for ErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},\"{}\"", self.code, self.message)
    }
}

#[derive(Debug)]
pub enum Error {
    /// Transport could not be established, or was lost
    Connection(String),
    /// Operation attempted on a session whose transport is closed
    NotConnected,
    IoError(std::io::Error),
    /// A single raw read or write exceeded its timeout. `command` is the
    /// command whose exchange timed out, when known.
    IoTimeout {
        command: Option<String>,
        timeout: Duration,
        detail: String,
    },
    /// Instrument accepted the command but did not signal completion in time
    OperationTimeout { command: String, timeout: Duration },
    /// Error queue was non-empty after a command
    Instrument {
        command: String,
        errors: Vec<ErrorEntry>,
    },
    /// Bulk transfer failed mid-way. `last_chunk` is the index of the last
    /// chunk that went through, if any.
    Transfer {
        last_chunk: Option<usize>,
        source: Box<Error>,
    },
    /// Reply could not be parsed into the requested type
    Decode(String),
    InvalidArgument(String),
    /// Resource or feature not supported by this crate
    NotSupported(String),
}
impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Error::IoTimeout { .. } | Error::OperationTimeout { .. }
        )
    }

    /// The underlying failure of a wrapped transfer error
    pub fn root(&self) -> &Error {
        match self {
            Error::Transfer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach the command to a timeout raised below the session layer
    pub(crate) fn with_command(self, cmd: &str) -> Self {
        match self {
            Error::IoTimeout {
                command: None,
                timeout,
                detail,
            } => Error::IoTimeout {
                command: Some(cmd.to_string()),
                timeout,
                detail,
            },
            Error::Transfer { last_chunk, source } => Error::Transfer {
                last_chunk,
                source: Box::new(source.with_command(cmd)),
            },
            other => other,
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::Transfer { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connection(desc) => write!(f, "Connection error: {desc}"),
            Error::NotConnected => write!(f, "Not connected"),
            Error::IoError(e) => write!(f, "IO error: {e}"),
            Error::IoTimeout {
                command,
                timeout,
                detail,
            } => {
                write!(f, "Timed out after {} ms", timeout.as_millis())?;
                if let Some(command) = command {
                    write!(f, " on `{command}`")?;
                }
                write!(f, ": {detail}")
            }
            Error::OperationTimeout { command, timeout } => write!(
                f,
                "Operation `{command}` did not complete within {} ms",
                timeout.as_millis()
            ),
            Error::Instrument { command, errors } => {
                write!(f, "Instrument reported error(s) after `{command}`: ")?;
                for (idx, err) in errors.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Error::Transfer { last_chunk, source } => match last_chunk {
                Some(chunk) => write!(f, "Transfer failed after chunk {chunk}: {source}"),
                None => write!(f, "Transfer failed before first chunk: {source}"),
            },
            Error::Decode(desc) => write!(f, "Decode error: {desc}"),
            Error::InvalidArgument(desc) => write!(f, "Invalid argument: {desc}"),
            Error::NotSupported(desc) => write!(f, "Not supported: {desc}"),
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_error_queue_entries() {
        let entry = ErrorEntry::from_response("-113,\"Undefined header;FOO\"\n").unwrap();
        assert_eq!(entry.code, -113);
        assert_eq!(entry.message, "Undefined header;FOO");
        assert!(!entry.is_no_error());

        let empty = ErrorEntry::from_response("0,\"No error\"").unwrap();
        assert!(empty.is_no_error());

        let bare = ErrorEntry::from_response("0").unwrap();
        assert!(bare.is_no_error());
        assert_eq!(bare.message, "");
    }

    #[test]
    fn rejects_non_numeric_code() {
        assert!(matches!(
            ErrorEntry::from_response("abc,\"x\""),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn instrument_error_lists_every_entry() {
        let err = Error::Instrument {
            command: "FOO".into(),
            errors: vec![
                ErrorEntry {
                    code: -113,
                    message: "Undefined header".into(),
                },
                ErrorEntry {
                    code: -222,
                    message: "Data out of range".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("-113,\"Undefined header\""));
        assert!(msg.contains("-222,\"Data out of range\""));
    }

    #[test]
    fn timeouts_carry_command_and_duration() {
        let err = Error::IoTimeout {
            command: None,
            timeout: Duration::from_millis(200),
            detail: "reading 1 bytes".into(),
        };
        let err = Error::Transfer {
            last_chunk: None,
            source: Box::new(err),
        }
        .with_command("MMEM:DATA? '/a.bin'");

        assert!(err.is_timeout());
        let Error::IoTimeout {
            command, timeout, ..
        } = err.root()
        else {
            panic!("expected timeout, got {err}");
        };
        assert_eq!(command.as_deref(), Some("MMEM:DATA? '/a.bin'"));
        assert_eq!(*timeout, Duration::from_millis(200));
        assert!(err.to_string().contains("200 ms on `MMEM:DATA? '/a.bin'`"));

        /* An already named command is kept */
        let named = Error::IoTimeout {
            command: Some("*IDN?".into()),
            timeout: Duration::ZERO,
            detail: String::new(),
        }
        .with_command("SYST:ERR?");
        assert!(matches!(named, Error::IoTimeout { command: Some(c), .. } if c == "*IDN?"));
    }
}
