//! Reading layer archives that may or may not be xz compressed.

use std::{
    io::{self, SeekFrom},
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::bufread::XzDecoder;
use futures::ready;
use tokio::io::{AsyncRead, AsyncSeek, BufReader, ReadBuf};
use tracing::debug;

/// Size of the scratch buffer used to discard output on forward seeks.
const SKIP_BUFFER_SIZE: usize = 8 * 1024;

/// What to continue with once the source is rewound.
#[derive(Clone, Copy, Debug)]
enum Then {
    Compressed,
    Raw,
}

enum Mode<R> {
    Compressed(XzDecoder<BufReader<R>>),
    Rewinding {
        source: R,
        target: u64,
        started: bool,
        then: Then,
    },
    Raw(R),
    /// Only observable if a mode transition was interrupted.
    Poisoned,
}

impl<R: AsyncRead> Mode<R> {
    fn into_source(self) -> Option<R> {
        match self {
            Mode::Compressed(decoder) => Some(decoder.into_inner().into_inner()),
            Mode::Rewinding { source, .. } | Mode::Raw(source) => Some(source),
            Mode::Poisoned => None,
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::other("archive reader is in an inconsistent state")
}

/// Wraps the bytes of a layer and exposes the tar stream inside.
///
/// Layers are expected to be xz compressed, but plain tarballs are accepted
/// too: if the decoder fails before it produced a single byte, the reader
/// rewinds the source and keeps reading it as-is from then on. Errors of the
/// decoder after that point are reported as [io::ErrorKind::InvalidData].
///
/// Seeking is supported in both modes. While decompressing, positions refer
/// to the decompressed stream: forward seeks discard output, backward seeks
/// restart decompression from the start of the source, and seeking relative
/// to the end is not supported.
pub struct ArchiveReader<R> {
    mode: Mode<R>,
    /// Position in the (decompressed) stream, as seen by the caller.
    pos: u64,
    /// Decompressed bytes to discard before reaching `pos`.
    skip: u64,
    /// Whether the decoder produced any output so far.
    decoded: bool,
}

impl<R> ArchiveReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Wraps a source positioned at the start of the layer.
    pub fn new(source: R) -> Self {
        Self {
            mode: Mode::Compressed(XzDecoder::new(BufReader::new(source))),
            pos: 0,
            skip: 0,
            decoded: false,
        }
    }

    /// Returns the current position in the (decompressed) stream.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns false once the reader fell back to reading the source as-is.
    pub fn is_compressed(&self) -> bool {
        matches!(
            self.mode,
            Mode::Compressed(_)
                | Mode::Rewinding {
                    then: Then::Compressed,
                    ..
                }
        )
    }

    /// Returns the underlying source, at an unspecified position.
    pub fn into_inner(self) -> io::Result<R> {
        self.mode.into_source().ok_or_else(poisoned)
    }

    fn rewind_then(&mut self, target: u64, then: Then) {
        self.mode = match mem::replace(&mut self.mode, Mode::Poisoned).into_source() {
            Some(source) => Mode::Rewinding {
                source,
                target,
                started: false,
                then,
            },
            None => Mode::Poisoned,
        };
    }

    /// Drives a pending rewind of the source to completion.
    fn poll_rewind(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Mode::Rewinding {
            source,
            target,
            started,
            ..
        } = &mut self.mode
        else {
            return Poll::Ready(Ok(()));
        };

        if !*started {
            Pin::new(&mut *source).start_seek(SeekFrom::Start(*target))?;
            *started = true;
        }
        ready!(Pin::new(&mut *source).poll_complete(cx))?;

        self.mode = match mem::replace(&mut self.mode, Mode::Poisoned) {
            Mode::Rewinding {
                source,
                then: Then::Compressed,
                ..
            } => Mode::Compressed(XzDecoder::new(BufReader::new(source))),
            Mode::Rewinding {
                source,
                then: Then::Raw,
                ..
            } => Mode::Raw(source),
            other => other,
        };

        Poll::Ready(Ok(()))
    }
}

/// Reads from the decoder into `buf`, after discarding `skip` bytes.
/// Returns the number of bytes placed into `buf`.
fn poll_decode<R>(
    decoder: &mut XzDecoder<BufReader<R>>,
    skip: &mut u64,
    decoded: &mut bool,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    while *skip > 0 {
        let mut scratch = [0u8; SKIP_BUFFER_SIZE];
        let len = (*skip).min(SKIP_BUFFER_SIZE as u64) as usize;
        let mut scratch = ReadBuf::new(&mut scratch[..len]);

        ready!(Pin::new(&mut *decoder).poll_read(cx, &mut scratch))?;
        let n = scratch.filled().len();
        if n == 0 {
            // seeked past the end
            *skip = 0;
            return Poll::Ready(Ok(0));
        }
        *decoded = true;
        *skip -= n as u64;
    }

    let before = buf.filled().len();
    ready!(Pin::new(decoder).poll_read(cx, buf))?;
    let n = buf.filled().len() - before;
    if n > 0 {
        *decoded = true;
    }

    Poll::Ready(Ok(n))
}

impl<R> AsyncRead for ArchiveReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            ready!(this.poll_rewind(cx))?;

            match &mut this.mode {
                Mode::Raw(source) => {
                    let before = buf.filled().len();
                    ready!(Pin::new(source).poll_read(cx, buf))?;
                    this.pos += (buf.filled().len() - before) as u64;
                    return Poll::Ready(Ok(()));
                }
                Mode::Compressed(decoder) => {
                    match ready!(poll_decode(
                        decoder,
                        &mut this.skip,
                        &mut this.decoded,
                        cx,
                        buf
                    )) {
                        Ok(n) => {
                            this.pos += n as u64;
                            return Poll::Ready(Ok(()));
                        }
                        Err(e) if !this.decoded => {
                            debug!(err = %e, "layer is not xz compressed, reading it as-is");
                            this.skip = 0;
                            this.rewind_then(this.pos, Then::Raw);
                        }
                        Err(e) => {
                            return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e)))
                        }
                    }
                }
                Mode::Rewinding { .. } | Mode::Poisoned => return Poll::Ready(Err(poisoned())),
            }
        }
    }
}

impl<R> AsyncSeek for ArchiveReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();

        match &mut this.mode {
            Mode::Raw(source) => Pin::new(source).start_seek(position),
            Mode::Compressed(_) => {
                let target = match position {
                    SeekFrom::Start(offset) => offset,
                    SeekFrom::Current(delta) => {
                        this.pos.checked_add_signed(delta).ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "invalid seek to a negative or overflowing position",
                            )
                        })?
                    }
                    SeekFrom::End(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "cannot seek relative to the end of a compressed archive",
                        ))
                    }
                };

                let decoder_pos = this.pos - this.skip;
                if target >= decoder_pos {
                    this.skip = target - decoder_pos;
                } else {
                    this.skip = target;
                    this.rewind_then(0, Then::Compressed);
                }
                this.pos = target;

                Ok(())
            }
            Mode::Rewinding { .. } => Err(io::Error::other(
                "other seek or rewind already in progress",
            )),
            Mode::Poisoned => Err(poisoned()),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        ready!(this.poll_rewind(cx))?;

        match &mut this.mode {
            Mode::Raw(source) => {
                let pos = ready!(Pin::new(source).poll_complete(cx))?;
                this.pos = pos;
                Poll::Ready(Ok(pos))
            }
            Mode::Compressed(_) => Poll::Ready(Ok(this.pos)),
            Mode::Rewinding { .. } | Mode::Poisoned => Poll::Ready(Err(poisoned())),
        }
    }
}
