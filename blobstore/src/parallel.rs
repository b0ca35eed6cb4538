//! Parallel transfer of large blobs.
//!
//! [ParallelRangeReader] splits a remote object into a fixed number of byte
//! ranges, downloads all of them concurrently into a local temporary file,
//! and serves the contents strictly sequentially from offset 0, as if they
//! were read from a single request.

use std::{fmt, io::SeekFrom, ops::Range, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{ByteStream, Error};

/// A remote object which can be read in independent byte ranges.
#[async_trait]
pub trait RangedObject: fmt::Display + Send + Sync + 'static {
    /// The total size of the object, in bytes.
    fn size(&self) -> u64;

    /// Open a new, independent read of the given half-open byte range.
    async fn read_range(&self, range: Range<u64>) -> Result<ByteStream, Error>;
}

/// Knobs for parallel blob transfers.
/// Can be parsed from the query string of a store address with [serde_qs].
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelFetchConfig {
    /// Number of ranges a blob is split into, and downloaded concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Blobs larger than this (in bytes) are fetched in parallel.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: u64,

    /// How long a reader waits for the next missing byte to arrive before
    /// giving up on the transfer.
    #[serde_as(as = "DurationSeconds<String>")]
    #[serde(default = "default_stall_timeout", rename = "stall_timeout_secs")]
    pub stall_timeout: Duration,

    /// Directory the transfer buffer is created in.
    /// Uses the system temporary directory if unset.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_concurrency() -> usize {
    5
}

fn default_parallel_threshold() -> u64 {
    1024 * 1024
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ParallelFetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            parallel_threshold: default_parallel_threshold(),
            stall_timeout: default_stall_timeout(),
            spool_dir: None,
        }
    }
}

/// Splits `[0, size)` into `parts` contiguous ranges of `size / parts` bytes.
/// The last range absorbs the remainder, so with `size < parts` all leading
/// ranges are empty.
fn byte_ranges(size: u64, parts: usize) -> Vec<Range<u64>> {
    let parts = parts.max(1) as u64;
    let chunk_size = size / parts;

    (0..parts)
        .map(|i| {
            let start = chunk_size * i;
            let end = if i == parts - 1 {
                size
            } else {
                chunk_size * (i + 1)
            };
            start..end
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Progress {
    /// All bytes below this offset are present in the buffer.
    max_completed_byte: u64,
    /// Number of leading ranges that completed without a gap.
    completed_ranges: usize,
    /// The lowest range index whose transfer failed, and why.
    failure: Option<(usize, String)>,
}

impl Progress {
    /// Returns the failure reason if a failed range is the next one the
    /// reader needs. Failures of later ranges don't stop reading the prefix.
    fn blocking_failure(&self) -> Option<&str> {
        match &self.failure {
            Some((index, reason)) if *index <= self.completed_ranges => Some(reason),
            _ => None,
        }
    }
}

/// One slot per range, filled with the end offset once the range task wrote
/// and flushed all of its bytes.
struct CompletionSlots {
    slots: Mutex<Vec<Option<u64>>>,
    progress: watch::Sender<Progress>,
}

impl CompletionSlots {
    fn new(count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; count]),
            progress: watch::Sender::new(Progress::default()),
        }
    }

    fn complete(&self, index: usize, end: u64) {
        let mut slots = self.slots.lock();
        slots[index] = Some(end);

        // Advance only while the slots starting at the current pointer are
        // filled. A later range finishing first doesn't move progress past
        // the gap.
        self.progress.send_modify(|progress| {
            while let Some(Some(end)) = slots.get(progress.completed_ranges) {
                progress.max_completed_byte = *end;
                progress.completed_ranges += 1;
            }
        });
    }

    fn fail(&self, index: usize, reason: String) {
        self.progress.send_modify(|progress| match &progress.failure {
            Some((failed, _)) if *failed <= index => {}
            _ => progress.failure = Some((index, reason)),
        });
    }
}

/// Reads a [RangedObject] through concurrent range requests into a local
/// buffer, and exposes the buffer as a sequential stream.
///
/// Reading blocks until the bytes at the cursor arrived. As the buffer is
/// consumed from offset 0, a slow early range stalls the reader even if
/// later ranges are complete.
///
/// The temporary buffer is deleted and outstanding transfers are aborted
/// when the reader is dropped.
pub struct ParallelRangeReader {
    name: String,
    size: u64,
    cursor: u64,
    range_count: usize,

    buffer: async_tempfile::TempFile,
    // keeps the progress sender alive after all tasks finished
    _slots: Arc<CompletionSlots>,
    progress: watch::Receiver<Progress>,
    stall_timeout: Duration,
    buffering_complete: bool,

    // aborted on drop
    _tasks: JoinSet<()>,
    span: Span,
}

impl ParallelRangeReader {
    /// Set up the buffer and spawn one transfer task per range.
    #[instrument(skip_all, fields(object = %object, blob.size = object.size()), err)]
    pub async fn new(
        object: Arc<dyn RangedObject>,
        config: &ParallelFetchConfig,
    ) -> Result<Self, Error> {
        let size = object.size();
        let ranges = byte_ranges(size, config.concurrency);
        let buffer = match &config.spool_dir {
            Some(dir) => async_tempfile::TempFile::new_in(dir.clone()).await?,
            None => async_tempfile::TempFile::new().await?,
        };
        let slots = Arc::new(CompletionSlots::new(ranges.len()));

        let span = info_span!("parallel_fetch", object = %object, indicatif.pb_show = 1);
        span.pb_set_style(&strata_tracing::PB_TRANSFER_STYLE);
        span.pb_set_length(size);
        span.pb_set_message(&format!("Fetching {}", object));

        let mut tasks = JoinSet::new();
        for (index, range) in ranges.iter().cloned().enumerate() {
            if range.is_empty() {
                slots.complete(index, range.end);
                continue;
            }

            // Every task writes through its own handle, so the file cursors
            // don't interfere.
            let file = buffer.open_rw().await?;
            tasks.spawn(
                fetch_range(object.clone(), file, index, range, slots.clone())
                    .instrument(span.clone()),
            );
        }

        debug!(ranges = ranges.len(), "spawned range transfers");

        Ok(Self {
            name: object.to_string(),
            size,
            cursor: 0,
            range_count: ranges.len(),
            progress: slots.progress.subscribe(),
            buffer,
            _slots: slots,
            stall_timeout: config.stall_timeout,
            buffering_complete: false,
            _tasks: tasks,
            span,
        })
    }

    /// The total size of the object being read.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The number of bytes returned by [Self::read] so far.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Return up to `size` bytes from the current position.
    ///
    /// Returns an empty buffer at the end of the object. Waits for missing
    /// bytes to arrive, failing with [Error::TransferTimeout] if none arrive
    /// within the configured stall timeout, and with
    /// [Error::TransferInterrupted] if the transfer of the next bytes failed.
    pub async fn read(&mut self, size: usize) -> Result<Bytes, Error> {
        let span = self.span.clone();
        self.read_inner(size).instrument(span).await
    }

    async fn read_inner(&mut self, size: usize) -> Result<Bytes, Error> {
        if self.cursor >= self.size || size == 0 {
            return Ok(Bytes::new());
        }

        let wanted = (size as u64).min(self.size - self.cursor);
        let available = self.wait_until_available(self.cursor + 1).await?;
        let len = wanted.min(available - self.cursor) as usize;

        let mut buf = BytesMut::zeroed(len);
        let n = self.buffer.read(&mut buf).await?;
        if n == 0 {
            error!(
                object = %self.name,
                cursor = self.cursor,
                size = self.size,
                "got an empty read on the buffer"
            );
            return Err(Error::TransferInterrupted {
                cursor: self.cursor,
                size: self.size,
                reason: "empty read on the local buffer".to_string(),
            });
        }
        buf.truncate(n);
        self.cursor += n as u64;
        self.span.pb_inc(n as u64);

        Ok(buf.freeze())
    }

    /// Wait until all bytes below `offset` are in the buffer, and return the
    /// offset up to which bytes are available.
    async fn wait_until_available(&mut self, offset: u64) -> Result<u64, Error> {
        let (cursor, size, timeout) = (self.cursor, self.size, self.stall_timeout);

        let progress = {
            // Woken up on every change, the predicate is rechecked each time,
            // as a later range completing doesn't mean the gap got filled.
            let wait = self
                .progress
                .wait_for(|p| p.max_completed_byte >= offset || p.blocking_failure().is_some());

            match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(progress)) => progress.clone(),
                Ok(Err(_)) => {
                    return Err(Error::TransferInterrupted {
                        cursor,
                        size,
                        reason: "progress channel closed".to_string(),
                    })
                }
                Err(_) => {
                    warn!(object = %self.name, cursor, size, ?timeout, "transfer stalled");
                    return Err(Error::TransferTimeout {
                        cursor,
                        size,
                        timeout,
                    });
                }
            }
        };

        if progress.max_completed_byte < offset {
            let reason = progress
                .blocking_failure()
                .unwrap_or("range transfer failed")
                .to_string();
            return Err(Error::TransferInterrupted {
                cursor,
                size,
                reason,
            });
        }

        if !self.buffering_complete && progress.completed_ranges == self.range_count {
            self.buffering_complete = true;
            info!(
                object = %self.name,
                percent = %format!("{:.1}", 100.0 * cursor as f64 / size.max(1) as f64),
                "buffering complete, now serving straight from the buffer"
            );
        }

        Ok(progress.max_completed_byte)
    }

    /// Turn the reader into a stream of chunks of at most `chunk_size` bytes.
    /// A `chunk_size` of 0 is treated as 1, as an empty chunk marks the end.
    pub fn into_stream(mut self, chunk_size: usize) -> ByteStream {
        let chunk_size = chunk_size.max(1);
        Box::pin(async_stream::try_stream! {
            loop {
                let chunk = self.read(chunk_size).await?;
                if chunk.is_empty() {
                    break;
                }
                yield chunk;
            }
        })
    }
}

/// Fetch a single range into the buffer, and record its completion.
async fn fetch_range(
    object: Arc<dyn RangedObject>,
    mut file: async_tempfile::TempFile,
    index: usize,
    range: Range<u64>,
    slots: Arc<CompletionSlots>,
) {
    match copy_range(object.as_ref(), &mut file, range.clone()).await {
        Ok(()) => {
            debug!(index, start = range.start, end = range.end, "range complete");
            slots.complete(index, range.end);
        }
        Err(e) => {
            warn!(index, start = range.start, end = range.end, err = %e, "range transfer failed");
            slots.fail(index, format!("range {} ({:?}): {}", index, range, e));
        }
    }
}

async fn copy_range(
    object: &dyn RangedObject,
    file: &mut async_tempfile::TempFile,
    range: Range<u64>,
) -> Result<(), Error> {
    let expected = range.end - range.start;
    file.seek(SeekFrom::Start(range.start)).await?;

    let mut stream = object.read_range(range.clone()).await?;
    let mut written = 0;
    while let Some(chunk) = stream.try_next().await? {
        if written + chunk.len() as u64 > expected {
            return Err(Error::TransferInterrupted {
                cursor: range.start + written,
                size: object.size(),
                reason: format!("source returned more than the {} requested bytes", expected),
            });
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    // Make sure the bytes reached the file before announcing them.
    file.flush().await?;

    if written != expected {
        return Err(Error::TransferInterrupted {
            cursor: range.start + written,
            size: object.size(),
            reason: format!("source ended after {} of {} bytes", written, expected),
        });
    }

    Ok(())
}
