use std::{
    io::{Cursor, Error, ErrorKind, Result},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Returns true if `err` means the other end of the stream went away.
///
/// Reading from a pipe whose handle was closed underneath us fails with EBADF, and a reader torn
/// down mid-read may report a broken pipe.  Both are an end of the stream, not a failure.
fn is_closed(err: &Error) -> bool {
    err.kind() == ErrorKind::BrokenPipe
        || err.raw_os_error() == Some(rustix::io::Errno::BADF.raw_os_error())
}

/// An AsyncRead adapter that reports reads from a closed handle as a clean end-of-stream.
#[derive(Debug)]
pub(crate) struct ClosedAsEof<R> {
    inner: R,
}

impl<R> ClosedAsEof<R> {
    pub(crate) fn new(inner: R) -> Self {
        ClosedAsEof { inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ClosedAsEof<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) if is_closed(&err) => Poll::Ready(Ok(())),
            other => other,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    error: Option<Arc<Error>>,
    eof: bool,
}

/// Shared view of what a [`ReadTracker`] has seen.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReadStatus(Arc<Mutex<TrackerState>>);

impl ReadStatus {
    /// The first read error, if any.
    pub(crate) fn error(&self) -> Option<Arc<Error>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).error.clone()
    }

    /// Whether the reader hit end-of-stream.
    pub(crate) fn reached_eof(&self) -> bool {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).eof
    }
}

/// An AsyncRead adapter that records the first error and end-of-stream.
///
/// The wrapped reader is handed off to a consumer which may swallow its errors; the
/// [`ReadStatus`] lets the producer side tell a broken stream apart from a failing consumer.
#[derive(Debug)]
pub(crate) struct ReadTracker<R> {
    inner: R,
    status: ReadStatus,
}

impl<R> ReadTracker<R> {
    pub(crate) fn new(inner: R) -> (Self, ReadStatus) {
        let status = ReadStatus::default();
        (
            ReadTracker {
                inner,
                status: status.clone(),
            },
            status,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadTracker<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(ref result) = result {
            let mut state = self.status.0.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(()) if wanted && buf.filled().len() == before => state.eof = true,
                Ok(()) => {}
                Err(err) => {
                    state
                        .error
                        .get_or_insert_with(|| Arc::new(Error::new(err.kind(), err.to_string())));
                }
            }
        }
        result
    }
}

/// Wraps `reader` in a decompressor chosen by sniffing its first bytes.
///
/// gzip and zstd streams are decoded; anything else is passed through unchanged.
pub(crate) async fn decompress<R>(mut reader: R) -> Result<Pin<Box<dyn AsyncRead + Send>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut magic = Vec::with_capacity(ZSTD_MAGIC.len());
    (&mut reader)
        .take(ZSTD_MAGIC.len() as u64)
        .read_to_end(&mut magic)
        .await?;

    let is_gzip = magic.starts_with(GZIP_MAGIC);
    let is_zstd = magic.starts_with(ZSTD_MAGIC);
    let stream = BufReader::new(Cursor::new(magic).chain(reader));

    Ok(if is_gzip {
        let mut decoder = GzipDecoder::new(stream);
        decoder.multiple_members(true);
        Box::pin(decoder)
    } else if is_zstd {
        Box::pin(ZstdDecoder::new(stream))
    } else {
        Box::pin(stream)
    })
}
