use std::{fmt, ops::Range, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::{ByteStream, Error, RangedObject};

/// Size of the chunks the test objects emit per range.
const CHUNK_SIZE: usize = 1000;

/// Produces a blob of the given size with a non-repeating-looking pattern,
/// so misplaced ranges show up as mismatches.
pub fn blob_of_size(size: usize) -> Bytes {
    (0..size)
        .map(|i| (i % 251) as u8 ^ (i / 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

fn chunked(data: Bytes) -> ByteStream {
    let chunks = (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|offset| Ok(data.slice(offset..(offset + CHUNK_SIZE).min(data.len()))))
        .collect::<Vec<_>>();
    futures::stream::iter(chunks).boxed()
}

/// Serves ranges from memory. Ranges closer to the start of the blob are
/// delayed longer, so later ranges complete first.
pub struct DelayedObject {
    data: Bytes,
}

impl DelayedObject {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl fmt::Display for DelayedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delayed-object({})", self.data.len())
    }
}

#[async_trait]
impl RangedObject for DelayedObject {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<ByteStream, Error> {
        let remaining = self.data.len() as u64 - range.start;
        let delay_ms = 50 * remaining / self.size().max(1);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        Ok(chunked(
            self.data.slice(range.start as usize..range.end as usize),
        ))
    }
}

/// Fails the range starting at the given offset halfway through.
pub struct FailingObject {
    data: Bytes,
    fail_at: u64,
}

impl FailingObject {
    pub fn new(data: Bytes, fail_at: u64) -> Self {
        Self { data, fail_at }
    }
}

impl fmt::Display for FailingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failing-object({})", self.data.len())
    }
}

#[async_trait]
impl RangedObject for FailingObject {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<ByteStream, Error> {
        let data = self.data.slice(range.start as usize..range.end as usize);
        if range.start != self.fail_at {
            return Ok(chunked(data));
        }

        let half = data.slice(..data.len() / 2);
        Ok(futures::stream::iter([
            Ok(half),
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
        ])
        .boxed())
    }
}

/// Never answers the request for the first range.
pub struct StalledObject {
    data: Bytes,
}

impl StalledObject {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl fmt::Display for StalledObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stalled-object({})", self.data.len())
    }
}

#[async_trait]
impl RangedObject for StalledObject {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<ByteStream, Error> {
        if range.start == 0 {
            futures::future::pending::<()>().await;
        }

        Ok(chunked(
            self.data.slice(range.start as usize..range.end as usize),
        ))
    }
}
