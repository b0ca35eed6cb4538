//! Tarballs inside a layer may be compressed once more, with gzip or bzip2.
//! These are recognized by their magic bytes and decompressed on the fly.

use std::{io::Cursor, pin::Pin};

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder};
use tokio::io::{self, AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const BYTES_NEEDED: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Gzip,
    Bzip2,
}

impl Algorithm {
    fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(&GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Some(Self::Bzip2)
        } else {
            None
        }
    }
}

/// A stream of tar bytes.
pub type TarReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Peeks at the start of `reader` and, if it is gzip or bzip2 compressed,
/// wraps it in the matching decoder. Anything else is passed through.
pub async fn decompress_tar<R>(mut reader: R) -> io::Result<TarReader>
where
    R: AsyncRead + Send + Sync + Unpin + 'static,
{
    let mut magic = Vec::with_capacity(BYTES_NEEDED);
    (&mut reader)
        .take(BYTES_NEEDED as u64)
        .read_to_end(&mut magic)
        .await?;

    let algorithm = Algorithm::from_magic(&magic);
    let reader = BufReader::new(Cursor::new(magic).chain(reader));

    Ok(match algorithm {
        Some(Algorithm::Gzip) => {
            debug!("tarball is gzip compressed");
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            Box::pin(decoder)
        }
        Some(Algorithm::Bzip2) => {
            debug!("tarball is bzip2 compressed");
            let mut decoder = BzDecoder::new(reader);
            decoder.multiple_members(true);
            Box::pin(decoder)
        }
        None => Box::pin(reader),
    })
}
