//! Command dispatch on top of a transport: status checking, typed
//! replies and operation-complete synchronisation.

use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use log::{debug, info, warn};
use strum_macros::{AsRefStr, EnumIter};
use tokio::time::Instant;

use crate::{
    block::{self, BinFloatFormat, BlockHeader},
    config::{self, SessionConfig},
    error::{Error, ErrorEntry, Result},
    model::ModelInfo,
    protocol::{self, ScpiProtocol},
    repcap::RepCaps,
};

/// Stop draining the error queue after this many entries
const ERROR_QUEUE_LIMIT: usize = 1000;

/// Shape of the reply a command is expected to produce
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, EnumIter)]
pub enum ReplyKind {
    /// Plain write, nothing is read back
    None,
    Str,
    Int,
    Float,
    /// ASCII list or binary block of floats
    FloatList,
    /// Raw binary block payload
    Block,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    None,
    Str(String),
    Int(i64),
    Float(f64),
    FloatList(Vec<f64>),
    Block(Vec<u8>),
}

/// An outbound SCPI command with the reply it expects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub reply: ReplyKind,
}
impl Command {
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply: ReplyKind::None,
        }
    }

    pub fn query(text: impl Into<String>, reply: ReplyKind) -> Self {
        Self {
            text: text.into(),
            reply,
        }
    }

    /// Fill the `<Name>` placeholders of `template` from `caps`
    pub fn from_template(template: &str, caps: &RepCaps, reply: ReplyKind) -> Result<Self> {
        Ok(Self {
            text: caps.apply(template)?,
            reply,
        })
    }
}

/// Reply as read off the wire, before typing
pub(crate) enum RawReply {
    Text(String),
    Block(Vec<u8>),
}
impl RawReply {
    fn into_floats(self, format: BinFloatFormat) -> Result<Vec<f64>> {
        match self {
            RawReply::Text(text) => block::parse_ascii_floats(&text),
            RawReply::Block(data) => format.decode(&data),
        }
    }
}

/// A conversation with one instrument. Every operation takes `&mut self`,
/// so there is never more than one command in flight.
pub struct Session {
    proto: Box<dyn ScpiProtocol>,
    config: SessionConfig,
    idn: Option<String>,
    /// Commands went out whose status was never checked, so the error
    /// queue may hold entries that belong to them
    unchecked: bool,
    /// Timeouts seen so far
    timeouts: u64,
}
impl Session {
    /// Connect to `resource` and apply `config`
    pub async fn open(resource: &str, config: SessionConfig) -> Result<Self> {
        let proto = protocol::scpi_from_uri(resource, &config).await?;
        Self::with_protocol(proto, config).await
    }

    /// Wrap an existing transport, connecting it if needed
    pub async fn with_protocol(
        mut proto: Box<dyn ScpiProtocol>,
        config: SessionConfig,
    ) -> Result<Self> {
        config::check_chunk_size(config.data_chunk_size)?;
        if !proto.is_connected() {
            proto.connect().await?;
        }
        proto.set_io_timeout(config.io_timeout);

        let mut session = Self {
            proto,
            config,
            idn: None,
            unchecked: false,
            timeouts: 0,
        };

        if let Err(e) = session.init().await {
            if let Err(close_err) = session.close().await {
                warn!("Failed to close session after init error: {close_err}");
            }
            return Err(e);
        }

        Ok(session)
    }

    async fn init(&mut self) -> Result<()> {
        if self.config.id_query {
            let model = self.model().await?;
            info!(
                "Connected to {} {} ({})",
                model.manufacturer,
                model.model,
                self.proto.resource()
            );
        }
        if self.config.reset {
            self.reset().await?;
        }
        Ok(())
    }

    /// Release the transport. Safe to call more than once; dropping the
    /// session releases it as well.
    pub async fn close(&mut self) -> Result<()> {
        if self.proto.is_connected() {
            info!("Closing session to {}", self.proto.resource());
        }
        self.proto.disconnect().await
    }

    pub fn is_open(&self) -> bool {
        self.proto.is_connected()
    }

    pub fn resource(&self) -> String {
        self.proto.resource()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.config.io_timeout = timeout;
        self.proto.set_io_timeout(timeout);
    }

    pub fn opc_timeout(&self) -> Duration {
        self.config.opc_timeout
    }

    pub fn set_opc_timeout(&mut self, timeout: Duration) {
        self.config.opc_timeout = timeout;
    }

    pub fn set_bin_float_format(&mut self, format: BinFloatFormat) {
        self.config.bin_float_format = format;
    }

    pub fn set_data_chunk_size(&mut self, size: usize) -> Result<()> {
        self.config.data_chunk_size = config::check_chunk_size(size)?;
        Ok(())
    }

    pub fn set_opc_query_after_write(&mut self, enabled: bool) {
        self.config.opc_query_after_write = enabled;
    }

    pub fn status_checking(&self) -> bool {
        self.config.status_checking
    }

    /// Turn status checking on or off until told otherwise
    pub fn set_status_checking(&mut self, enabled: bool) {
        self.config.status_checking = enabled;
    }

    /// Turn status checking off until the returned guard is dropped. The
    /// previous setting comes back on every exit path, `?` included.
    pub fn suspend_status_checking(&mut self) -> StatusCheckingSuspended<'_> {
        let previous = self.config.status_checking;
        self.config.status_checking = false;
        StatusCheckingSuspended {
            session: self,
            previous,
        }
    }

    /// Use `timeout` as the I/O timeout, if given, and note rather than
    /// care about timeouts until the returned guard is dropped. The previous
    /// I/O timeout comes back with the guard.
    pub fn suppress_timeouts(&mut self, timeout: Option<Duration>) -> TimeoutsSuppressed<'_> {
        let previous = self.config.io_timeout;
        if let Some(timeout) = timeout {
            self.set_io_timeout(timeout);
        }
        TimeoutsSuppressed {
            seen: self.timeouts,
            session: self,
            previous,
        }
    }

    /// Send a command, no reply expected
    pub async fn write(&mut self, cmd: &str) -> Result<()> {
        if self.config.opc_query_after_write {
            let timeout = self.config.opc_timeout;
            return self.write_with_opc(cmd, timeout).await;
        }

        self.send_command(cmd).await?;
        self.check_status_after(cmd).await
    }

    /// Send `prefix` followed by `data` as a definite-length block
    pub async fn write_bin_block(&mut self, prefix: &str, data: &[u8]) -> Result<()> {
        let mut msg = Vec::with_capacity(prefix.len() + data.len() + 16);
        msg.extend_from_slice(prefix.as_bytes());
        msg.extend_from_slice(&block::encode_block(data));

        self.send_message(prefix, &msg).await?;
        self.check_status_after(prefix).await
    }

    /// Send a query and return its reply line, terminator removed
    pub async fn query(&mut self, cmd: &str) -> Result<String> {
        self.send_command(cmd).await?;
        let resp = match self.proto.recv().await {
            Ok(resp) => resp,
            Err(e) => return Err(self.reply_failed(cmd, e)),
        };
        self.check_status_after(cmd).await?;

        Ok(String::from_utf8_lossy(&resp).trim().to_string())
    }

    pub async fn query_int(&mut self, cmd: &str) -> Result<i64> {
        let resp = self.query(cmd).await?;
        parse_int(&resp)
    }

    pub async fn query_float(&mut self, cmd: &str) -> Result<f64> {
        let resp = self.query(cmd).await?;
        parse_float(&resp)
    }

    pub async fn query_bool(&mut self, cmd: &str) -> Result<bool> {
        let resp = self.query(cmd).await?;
        match resp.to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            _ => Err(Error::Decode(format!("Could not parse `{resp}` as boolean"))),
        }
    }

    /// Comma-separated reply, each element trimmed of whitespace and quotes
    pub async fn query_str_list(&mut self, cmd: &str) -> Result<Vec<String>> {
        let resp = self.query(cmd).await?;
        if resp.is_empty() {
            return Ok(vec![]);
        }

        Ok(resp
            .split(',')
            .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
            .collect())
    }

    /// Float list reply, accepted as ASCII or as a binary block in the
    /// session's [`BinFloatFormat`]
    pub async fn query_float_list(&mut self, cmd: &str) -> Result<Vec<f64>> {
        self.send_command(cmd).await?;
        let reply = self.read_reply_for(cmd).await?;
        self.check_status_after(cmd).await?;

        reply.into_floats(self.config.bin_float_format)
    }

    /// Binary block reply payload
    pub async fn query_bin_block(&mut self, cmd: &str) -> Result<Vec<u8>> {
        self.send_command(cmd).await?;
        let reply = self.read_reply_for(cmd).await?;
        self.check_status_after(cmd).await?;

        match reply {
            RawReply::Block(data) => Ok(data),
            RawReply::Text(text) => Err(Error::Decode(format!(
                "Expected binary block from `{cmd}`, got `{text}`"
            ))),
        }
    }

    pub async fn query_typed(&mut self, cmd: &str, kind: ReplyKind) -> Result<Reply> {
        Ok(match kind {
            ReplyKind::None => {
                self.write(cmd).await?;
                Reply::None
            }
            ReplyKind::Str => Reply::Str(self.query(cmd).await?),
            ReplyKind::Int => Reply::Int(self.query_int(cmd).await?),
            ReplyKind::Float => Reply::Float(self.query_float(cmd).await?),
            ReplyKind::FloatList => Reply::FloatList(self.query_float_list(cmd).await?),
            ReplyKind::Block => Reply::Block(self.query_bin_block(cmd).await?),
        })
    }

    pub async fn execute(&mut self, command: &Command) -> Result<Reply> {
        self.query_typed(&command.text, command.reply).await
    }

    /// Send `cmd` chained with `*OPC?` and wait for the instrument to
    /// report completion
    pub async fn write_with_opc(&mut self, cmd: &str, timeout: Duration) -> Result<()> {
        debug!(command = cmd, timeout_ms = timeout.as_millis() as u64; "write_with_opc");

        self.send_command(&format!("{cmd};*OPC?")).await?;
        let resp = self.recv_opc_reply(cmd, timeout).await?;
        if resp != "1" {
            return Err(Error::Decode(format!(
                "Unexpected *OPC? reply `{resp}` after `{cmd}`"
            )));
        }

        self.check_status_after(cmd).await
    }

    /// Like [`Session::write_with_opc`], handing the outcome to `handler`
    /// exactly once before returning it
    pub async fn write_with_opc_notify<F>(
        &mut self,
        cmd: &str,
        timeout: Duration,
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(&Result<()>) + Send,
    {
        let res = self.write_with_opc(cmd, timeout).await;
        handler(&res);
        res
    }

    /// Query chained with `*OPC?`; the reply is only returned once the
    /// instrument reports completion
    pub async fn query_with_opc(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        debug!(command = cmd, timeout_ms = timeout.as_millis() as u64; "query_with_opc");

        self.send_command(&format!("{cmd};*OPC?")).await?;
        let resp = self.recv_opc_reply(cmd, timeout).await?;
        self.check_status_after(cmd).await?;

        match resp.rsplit_once(';') {
            Some((payload, "1")) => Ok(payload.trim().to_string()),
            _ => Err(Error::Decode(format!(
                "Reply to `{cmd};*OPC?` lacks completion marker: `{resp}`"
            ))),
        }
    }

    pub async fn query_float_with_opc(&mut self, cmd: &str, timeout: Duration) -> Result<f64> {
        let resp = self.query_with_opc(cmd, timeout).await?;
        parse_float(&resp)
    }

    /// Query `query` every `interval` until `predicate` accepts the value,
    /// returning that value. Fails with `OperationTimeout` once `timeout`
    /// has passed without a match.
    pub async fn poll_status_until<P>(
        &mut self,
        query: &str,
        mut predicate: P,
        interval: Duration,
        timeout: Duration,
    ) -> Result<i64>
    where
        P: FnMut(i64) -> bool + Send,
    {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "Poll interval must be non-zero".into(),
            ));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let value = parse_int(&self.query_unchecked(query).await?)?;
            if predicate(value) {
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                self.timeouts += 1;
                return Err(Error::OperationTimeout {
                    command: query.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Status-register synchronisation: arm the OPC bit with `cmd;*OPC`
    /// and poll `*ESR?` until it is set
    pub async fn write_with_opc_polling(
        &mut self,
        cmd: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        /* Reading clears the register, a stale OPC bit must not end the wait */
        self.query_unchecked("*ESR?").await?;
        self.send_command(&format!("{cmd};*OPC")).await?;

        match self
            .poll_status_until("*ESR?", |esr| esr & 1 != 0, interval, timeout)
            .await
        {
            Err(Error::OperationTimeout { .. }) => {
                let e = Error::OperationTimeout {
                    command: cmd.to_string(),
                    timeout,
                };
                Err(self.reply_failed(cmd, e))
            }
            Err(e) => Err(self.reply_failed(cmd, e)),
            Ok(_) => self.check_status_after(cmd).await,
        }
    }

    /// Drain the instrument's error queue until it reports no error
    pub async fn query_all_errors(&mut self) -> Result<Vec<ErrorEntry>> {
        let mut errors = vec![];

        loop {
            let resp = match self.proto.query("SYST:ERR?").await {
                Ok(resp) => resp,
                Err(e) => return Err(self.reply_failed("SYST:ERR?", e)),
            };
            let entry = ErrorEntry::from_response(&String::from_utf8_lossy(&resp))?;
            if entry.is_no_error() {
                break;
            }
            if errors.len() >= ERROR_QUEUE_LIMIT {
                return Err(Error::Decode(format!(
                    "Error queue did not empty after {ERROR_QUEUE_LIMIT} entries"
                )));
            }
            errors.push(entry);
        }

        self.unchecked = false;
        Ok(errors)
    }

    /// Fail with `Instrument` if the error queue holds anything
    pub async fn check_status(&mut self, cmd: &str) -> Result<()> {
        let errors = self.query_all_errors().await?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Instrument {
                command: cmd.to_string(),
                errors,
            })
        }
    }

    /// Discard pending input and clear the status registers and error queue
    pub async fn clear_status(&mut self) -> Result<()> {
        self.proto.flush_rx(Duration::ZERO).await?;
        let resp = self.proto.query("*CLS;*OPC?").await?;
        if String::from_utf8_lossy(&resp).trim() != "1" {
            return Err(Error::Decode("Unexpected reply to *CLS;*OPC?".into()));
        }

        self.unchecked = false;
        Ok(())
    }

    /// `*TST?` under OPC. Returns the result code, 0 for a pass, and any
    /// message the instrument gave with it.
    pub async fn self_test(&mut self, timeout: Duration) -> Result<(i32, String)> {
        let resp = self.query_with_opc("*TST?", timeout).await?;
        let result = ErrorEntry::from_response(&resp)?;
        if result.code != 0 {
            warn!("Self test of {} failed: {result}", self.proto.resource());
        }
        Ok((result.code, result.message))
    }

    /// Hand the front panel back to the user
    pub async fn go_to_local(&mut self) -> Result<()> {
        self.send_command("&GTL").await?;
        self.check_status_after("&GTL").await
    }

    /// Lock the front panel while the session is in control
    pub async fn go_to_remote(&mut self) -> Result<()> {
        self.send_command("&GTR").await?;
        self.check_status_after("&GTR").await
    }

    /// `*RST`, synchronised with the OPC timeout, then clear status
    pub async fn reset(&mut self) -> Result<()> {
        let timeout = self.config.opc_timeout;
        self.write_with_opc("*RST", timeout).await?;
        self.clear_status().await
    }

    /// `*IDN?` reply, cached after the first query
    pub async fn idn_string(&mut self) -> Result<String> {
        if let Some(idn) = &self.idn {
            return Ok(idn.clone());
        }

        let idn = self.query("*IDN?").await?;
        self.idn = Some(idn.clone());
        Ok(idn)
    }

    pub async fn model(&mut self) -> Result<ModelInfo> {
        let idn = self.idn_string().await?;
        ModelInfo::from_idn(&idn)
    }

    /// Installed options as reported by `*OPT?`
    pub async fn query_options(&mut self) -> Result<Vec<String>> {
        let options = self.query_str_list("*OPT?").await?;
        Ok(options
            .into_iter()
            .filter(|o| !o.is_empty() && o != "0")
            .collect())
    }

    pub(crate) fn proto_mut(&mut self) -> &mut dyn ScpiProtocol {
        self.proto.as_mut()
    }

    pub(crate) async fn send_command(&mut self, cmd: &str) -> Result<()> {
        self.send_message(cmd, cmd.as_bytes()).await
    }

    /// Send one message, `context` naming it in errors. With status
    /// checking on, errors left over from unchecked commands are discarded
    /// first so they are never blamed on this one.
    pub(crate) async fn send_message(&mut self, context: &str, msg: &[u8]) -> Result<()> {
        if !self.config.status_checking {
            self.unchecked = true;
        } else if self.unchecked {
            /* Late replies to earlier commands are not error queue entries */
            self.proto.flush_rx(Duration::ZERO).await?;
            for stale in self.query_all_errors().await? {
                warn!("Discarding error left by an unchecked command: {stale}");
            }
        }

        match self.proto.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.reply_failed(context, e)),
        }
    }

    /// `cmd` went out but its exchange did not finish. Its error queue
    /// entries are left for the next checked command to discard.
    pub(crate) fn reply_failed(&mut self, cmd: &str, e: Error) -> Error {
        match e.root() {
            Error::Instrument { .. } => {}
            root => {
                if root.is_timeout() {
                    self.timeouts += 1;
                }
                self.unchecked = true;
            }
        }
        e.with_command(cmd)
    }

    pub(crate) async fn check_status_after(&mut self, cmd: &str) -> Result<()> {
        if self.config.status_checking {
            self.check_status(cmd).await
        } else {
            Ok(())
        }
    }

    async fn query_unchecked(&mut self, cmd: &str) -> Result<String> {
        self.send_command(cmd).await?;
        match self.proto.recv().await {
            Ok(resp) => Ok(String::from_utf8_lossy(&resp).trim().to_string()),
            Err(e) => Err(self.reply_failed(cmd, e)),
        }
    }

    async fn recv_opc_reply(&mut self, cmd: &str, timeout: Duration) -> Result<String> {
        let e = match self.proto.recv_until(b'\n', timeout).await {
            Ok(resp) => return Ok(String::from_utf8_lossy(&resp).trim().to_string()),
            Err(Error::IoTimeout { .. }) => Error::OperationTimeout {
                command: cmd.to_string(),
                timeout,
            },
            Err(e) => e,
        };
        Err(self.reply_failed(cmd, e))
    }

    async fn read_reply_for(&mut self, cmd: &str) -> Result<RawReply> {
        let timeout = self.config.io_timeout;
        match self.read_reply(timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.reply_failed(cmd, e)),
        }
    }

    /// Read one reply, binary block or ASCII line, whichever arrives
    pub(crate) async fn read_reply(&mut self, timeout: Duration) -> Result<RawReply> {
        let first = self.proto.recv_raw(1, Some(timeout)).await?;
        if first[0] != b'#' {
            let mut line = first;
            if line[0] != b'\n' {
                line.extend(self.proto.recv_until(b'\n', timeout).await?);
            }
            let text = String::from_utf8_lossy(&line).trim().to_string();
            debug!("recv: {text}");
            return Ok(RawReply::Text(text));
        }

        let data = match self.read_block_header(timeout).await? {
            BlockHeader::Definite(length) => {
                let chunk = self.config.data_chunk_size;
                let mut data = Vec::with_capacity(length);
                while data.len() < length {
                    let n = chunk.min(length - data.len());
                    data.extend(self.proto.recv_raw(n, Some(timeout)).await?);
                }
                self.consume_terminator(timeout).await?;
                data
            }
            BlockHeader::Indefinite => {
                let mut data = self.proto.recv_until(b'\n', timeout).await?;
                data.pop();
                data
            }
        };
        debug!("recv: block of {} bytes", data.len());

        Ok(RawReply::Block(data))
    }

    /// Read the `<n><length>` that follows a `#`
    pub(crate) async fn read_block_header(&mut self, timeout: Duration) -> Result<BlockHeader> {
        let digit = self.proto.recv_raw(1, Some(timeout)).await?;
        let n = BlockHeader::digit_count(digit[0])?;
        let digits = if n > 0 {
            self.proto.recv_raw(n, Some(timeout)).await?
        } else {
            vec![]
        };
        BlockHeader::from_length_digits(&digits)
    }

    /// Definite blocks are followed by the message terminator
    pub(crate) async fn consume_terminator(&mut self, timeout: Duration) -> Result<()> {
        self.proto.recv_until(b'\n', timeout).await?;
        Ok(())
    }
}

/// Status checking is off for as long as this guard lives. Derefs to the
/// session it was taken from.
pub struct StatusCheckingSuspended<'a> {
    session: &'a mut Session,
    previous: bool,
}
impl Deref for StatusCheckingSuspended<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}
impl DerefMut for StatusCheckingSuspended<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}
impl Drop for StatusCheckingSuspended<'_> {
    fn drop(&mut self) {
        self.session.config.status_checking = self.previous;
    }
}

/// I/O timeout override for a stretch of calls. Timeouts raised while it
/// lives are recorded, and [`TimeoutsSuppressed::absorb`] turns them into
/// `None`. Derefs to the session it was taken from.
pub struct TimeoutsSuppressed<'a> {
    session: &'a mut Session,
    previous: Duration,
    seen: u64,
}
impl TimeoutsSuppressed<'_> {
    pub fn timeout_occurred(&self) -> bool {
        self.session.timeouts > self.seen
    }

    /// Timeouts become `Ok(None)`, other errors pass through
    pub fn absorb<T>(&self, res: Result<T>) -> Result<Option<T>> {
        match res {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_timeout() => {
                debug!("Suppressed: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
impl Deref for TimeoutsSuppressed<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}
impl DerefMut for TimeoutsSuppressed<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}
impl Drop for TimeoutsSuppressed<'_> {
    fn drop(&mut self) {
        self.session.set_io_timeout(self.previous);
    }
}

fn parse_int(resp: &str) -> Result<i64> {
    let resp = resp.trim();
    if let Ok(value) = resp.parse() {
        return Ok(value);
    }

    /* Some instruments answer integer queries in NR3 form, e.g. 1.000E+00 */
    match resp.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => Ok(value as i64),
        _ => Err(Error::Decode(format!("Could not parse `{resp}` as integer"))),
    }
}

fn parse_float(resp: &str) -> Result<f64> {
    resp.trim()
        .parse()
        .map_err(|e| Error::Decode(format!("Could not parse `{resp}` as float: {e}")))
}
