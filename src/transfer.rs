//! Chunked file and block transfers with progress reporting.

use std::{borrow::Cow, path::Path, time::Duration};

use log::{debug, info};
use strum_macros::AsRefStr;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{
    block::BlockHeader,
    config,
    error::{Error, Result},
    session::Session,
};

/// Create or overwrite an instrument file from a block
pub const FILE_WRITE_CMD: &str = "MMEM:DATA";
/// Append a block to an instrument file
pub const FILE_APPEND_CMD: &str = "MMEM:DATA:APP";
/// Read an instrument file back as a block
pub const FILE_READ_CMD: &str = "MMEM:DATA?";

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub enum TransferDirection {
    /// Instrument to controller
    Reading,
    /// Controller to instrument
    Writing,
}

/// Delivered to the progress handler after every chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// Command the transfer belongs to
    pub context: String,
    pub direction: TransferDirection,
    pub chunk_index: usize,
    /// Bytes moved so far, this chunk included
    pub transferred: u64,
    pub total: u64,
    pub end_of_transfer: bool,
}

pub type ProgressHandler<'a> = &'a mut (dyn FnMut(&TransferProgress) + Send);

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
pub enum TransferState {
    Created,
    InProgress,
    Completed,
    Failed,
}

/// Book-keeping for one bulk copy: `Created -> InProgress -> Completed |
/// Failed`. The transferred count only grows and must equal the total
/// for the job to complete.
#[derive(Clone, Debug)]
pub struct TransferJob {
    source: String,
    destination: String,
    direction: TransferDirection,
    total: u64,
    chunk_size: usize,
    transferred: u64,
    chunks: usize,
    state: TransferState,
}
impl TransferJob {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        direction: TransferDirection,
        total: u64,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            source: source.into(),
            destination: destination.into(),
            direction,
            total,
            chunk_size: config::check_chunk_size(chunk_size)?,
            transferred: 0,
            chunks: 0,
            state: TransferState::Created,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Chunks needed for the whole payload. An empty payload still takes
    /// one (empty) chunk.
    pub fn chunk_count(&self) -> usize {
        if self.total == 0 {
            1
        } else {
            self.total.div_ceil(self.chunk_size as u64) as usize
        }
    }

    /// Index of the last chunk that went through
    pub fn last_chunk(&self) -> Option<usize> {
        self.chunks.checked_sub(1)
    }

    /// Size of the next chunk
    fn next_chunk_len(&self) -> usize {
        (self.chunk_size as u64).min(self.total - self.transferred) as usize
    }

    fn record_chunk(&mut self, bytes: usize, context: &str) -> Result<TransferProgress> {
        match self.state {
            TransferState::Created => self.state = TransferState::InProgress,
            TransferState::InProgress => {}
            TransferState::Completed | TransferState::Failed => {
                return Err(Error::InvalidArgument(format!(
                    "Transfer to {} already {}",
                    self.destination,
                    self.state.as_ref()
                )));
            }
        }

        let transferred = self.transferred + bytes as u64;
        if transferred > self.total {
            return Err(Error::InvalidArgument(format!(
                "Chunk of {bytes} bytes overruns transfer of {} bytes",
                self.total
            )));
        }
        self.transferred = transferred;

        let chunk_index = self.chunks;
        self.chunks += 1;

        Ok(TransferProgress {
            context: context.to_string(),
            direction: self.direction,
            chunk_index,
            transferred,
            total: self.total,
            end_of_transfer: chunk_index + 1 == self.chunk_count(),
        })
    }

    fn complete(&mut self) -> Result<()> {
        if self.state != TransferState::InProgress || self.transferred != self.total {
            return Err(Error::InvalidArgument(format!(
                "Transfer to {} ended at {} of {} bytes",
                self.destination, self.transferred, self.total
            )));
        }
        self.state = TransferState::Completed;
        Ok(())
    }

    /// Mark the job failed and wrap the cause
    fn fail(&mut self, source: Error) -> Error {
        self.state = TransferState::Failed;
        Error::Transfer {
            last_chunk: self.last_chunk(),
            source: Box::new(source),
        }
    }
}

fn notify(on_progress: &mut Option<ProgressHandler<'_>>, progress: &TransferProgress) {
    debug!(
        "{} chunk {}: {}/{} bytes",
        progress.direction.as_ref(),
        progress.chunk_index,
        progress.transferred,
        progress.total
    );
    if let Some(handler) = on_progress.as_deref_mut() {
        handler(progress);
    }
}

impl Session {
    /// Copy a local file to `remote` on the instrument, `chunk_bytes` at a
    /// time. The first chunk creates the file, later ones append to it.
    /// A failed transfer leaves whatever reached the instrument in place.
    pub async fn send_file(
        &mut self,
        local: impl AsRef<Path>,
        remote: &str,
        chunk_bytes: usize,
        mut on_progress: Option<ProgressHandler<'_>>,
    ) -> Result<TransferJob> {
        let local = local.as_ref();
        let mut file = File::open(local).await?;
        let total = file.metadata().await?.len();

        let mut job = TransferJob::new(
            local.display().to_string(),
            remote,
            TransferDirection::Writing,
            total,
            chunk_bytes,
        )?;
        info!(
            "Sending {} ({} bytes) to {} in {} chunk(s)",
            job.source(),
            total,
            remote,
            job.chunk_count()
        );

        match self.send_chunks(&mut file, &mut job, &mut on_progress).await {
            Ok(()) => Ok(job),
            Err(e) => Err(job.fail(e)),
        }
    }

    async fn send_chunks(
        &mut self,
        file: &mut File,
        job: &mut TransferJob,
        on_progress: &mut Option<ProgressHandler<'_>>,
    ) -> Result<()> {
        let context = format!("{FILE_WRITE_CMD} '{}'", job.destination());
        let mut buf = Vec::with_capacity(job.chunk_size());

        for index in 0..job.chunk_count() {
            let want = job.next_chunk_len();
            buf.clear();
            (&mut *file).take(want as u64).read_to_end(&mut buf).await?;
            if buf.len() != want {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} shrank during transfer", job.source()),
                )));
            }

            let cmd = if index == 0 {
                FILE_WRITE_CMD
            } else {
                FILE_APPEND_CMD
            };
            self.write_bin_block(&format!("{cmd} '{}',", job.destination()), &buf)
                .await?;

            let progress = job.record_chunk(buf.len(), &context)?;
            notify(on_progress, &progress);
        }

        job.complete()
    }

    /// Copy instrument file `remote` to a local file, `chunk_bytes` at a
    /// time
    pub async fn receive_file(
        &mut self,
        remote: &str,
        local: impl AsRef<Path>,
        chunk_bytes: usize,
        on_progress: Option<ProgressHandler<'_>>,
    ) -> Result<TransferJob> {
        self.query_bin_block_to_file(
            &format!("{FILE_READ_CMD} '{remote}'"),
            local,
            false,
            chunk_bytes,
            on_progress,
        )
        .await
    }

    /// Send `cmd` and stream the block it answers with into `local`,
    /// without holding the whole payload in memory. `local` is left alone
    /// unless a block arrives.
    pub async fn query_bin_block_to_file(
        &mut self,
        cmd: &str,
        local: impl AsRef<Path>,
        append: bool,
        chunk_bytes: usize,
        mut on_progress: Option<ProgressHandler<'_>>,
    ) -> Result<TransferJob> {
        config::check_chunk_size(chunk_bytes)?;

        self.send_command(cmd).await?;
        let res = self
            .receive_block_to_file(cmd, local.as_ref(), append, chunk_bytes, &mut on_progress)
            .await;
        match res {
            Ok(job) => Ok(job),
            Err(e) => Err(self.reply_failed(cmd, e)),
        }
    }

    async fn receive_block_to_file(
        &mut self,
        cmd: &str,
        local: &Path,
        append: bool,
        chunk_bytes: usize,
        on_progress: &mut Option<ProgressHandler<'_>>,
    ) -> Result<TransferJob> {
        let timeout = self.config().io_timeout;

        let first = self.proto_mut().recv_raw(1, Some(timeout)).await?;
        if first[0] != b'#' {
            let mut line = first;
            if line[0] != b'\n' {
                line.extend(self.proto_mut().recv_until(b'\n', timeout).await?);
            }
            return Err(Error::Decode(format!(
                "Expected binary block from `{cmd}`, got `{}`",
                String::from_utf8_lossy(&line).trim()
            )));
        }

        /* Indefinite blocks carry no length, so they are read up front */
        let (total, buffered) = match self.read_block_header(timeout).await? {
            BlockHeader::Definite(length) => (length as u64, None),
            BlockHeader::Indefinite => {
                let mut data = self.proto_mut().recv_until(b'\n', timeout).await?;
                data.pop();
                (data.len() as u64, Some(data))
            }
        };

        let mut job = TransferJob::new(
            cmd,
            local.display().to_string(),
            TransferDirection::Reading,
            total,
            chunk_bytes,
        )?;

        let opened = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(local)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) => {
                if buffered.is_none() {
                    self.discard_block(total, timeout).await?;
                }
                return Err(job.fail(e.into()));
            }
        };
        info!(
            "Receiving {} bytes from `{}` into {}",
            total,
            cmd,
            job.destination()
        );

        let res = self
            .receive_chunks(&mut file, &mut job, buffered.as_deref(), on_progress)
            .await;
        match res {
            Ok(()) => Ok(job),
            Err(e) => Err(job.fail(e)),
        }
    }

    /// Read and drop the rest of a definite block so the next reply lines up
    async fn discard_block(&mut self, length: u64, timeout: Duration) -> Result<()> {
        let chunk = self.config().data_chunk_size as u64;
        let mut left = length;
        while left > 0 {
            let n = chunk.min(left);
            self.proto_mut().recv_raw(n as usize, Some(timeout)).await?;
            left -= n;
        }
        self.consume_terminator(timeout).await
    }

    async fn receive_chunks(
        &mut self,
        file: &mut File,
        job: &mut TransferJob,
        buffered: Option<&[u8]>,
        on_progress: &mut Option<ProgressHandler<'_>>,
    ) -> Result<()> {
        let timeout = self.config().io_timeout;
        let context = job.source().to_string();

        for _ in 0..job.chunk_count() {
            let want = job.next_chunk_len();
            let chunk = match buffered {
                Some(data) => {
                    let start = job.transferred() as usize;
                    Cow::Borrowed(&data[start..start + want])
                }
                None => Cow::Owned(self.proto_mut().recv_raw(want, Some(timeout)).await?),
            };

            file.write_all(&chunk).await?;

            let progress = job.record_chunk(chunk.len(), &context)?;
            notify(on_progress, &progress);
        }

        if buffered.is_none() {
            self.consume_terminator(timeout).await?;
        }
        file.flush().await?;

        self.check_status_after(&context).await?;
        job.complete()
    }

    /// Fetch trace or waveform data in one logical read. The reply may be
    /// an ASCII list or a binary block; the block length comes from its
    /// header, so the read is bounded.
    pub async fn fetch_numeric_block(&mut self, cmd: &str) -> Result<Vec<f64>> {
        let values = self.query_float_list(cmd).await?;
        debug!("`{cmd}`: fetched {} values", values.len());
        Ok(values)
    }
}
