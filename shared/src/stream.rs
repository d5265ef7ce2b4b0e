//! The framed stream shared by every application protocol: ASCII verbs
//! terminated by `\n`, decimal parameters one per line, binary payloads
//! preceded by a size line.

use std::time::Duration;

use futures::io::{
    AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader,
    ReadHalf, WriteHalf,
};

/// Upper bound for a single line; a peer exceeding it is treated as
/// violating the protocol and its handler terminates.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Errors surfaced by framed-stream reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The per-verb deadline elapsed before a full frame arrived.
    #[error("stream operation timed out")]
    Timeout,

    /// The peer closed the stream cleanly before a full frame arrived.
    #[error("stream closed before a full frame arrived")]
    Eof,

    /// The transport failed or the peer reset the stream.
    #[error("stream reset: {0}")]
    Reset(std::io::Error),

    /// A line exceeded [`MAX_LINE_LEN`].
    #[error("frame line exceeded {MAX_LINE_LEN} bytes")]
    LineTooLong,

    /// A verb or parameter line was not valid UTF-8.
    #[error("frame line is not valid UTF-8")]
    InvalidUtf8,
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => StreamError::Eof,
            std::io::ErrorKind::TimedOut => StreamError::Timeout,
            _ => StreamError::Reset(e),
        }
    }
}

impl StreamError {
    /// Whether the underlying stream is beyond reuse (as opposed to a
    /// deadline that expired while the stream stayed healthy).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Eof
                | StreamError::Reset(_)
                | StreamError::LineTooLong
                | StreamError::InvalidUtf8
        )
    }
}

/// Run a stream future under an optional deadline; `Duration::ZERO` disables it.
async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, StreamError>>,
) -> Result<T, StreamError> {
    if timeout.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| StreamError::Timeout)?
    }
}

/// Read half of a framed stream.
pub struct FramedReader<S> {
    reader: BufReader<ReadHalf<S>>,
    peer: String,
}

impl<S: AsyncRead + Unpin> FramedReader<S> {
    /// Remote peer identifier, for logging.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read up to and including `delim`. A timeout of zero disables the
    /// deadline. The returned string still carries the delimiter.
    pub async fn read_string(
        &mut self,
        delim: u8,
        timeout: Duration,
    ) -> Result<String, StreamError> {
        let read = async {
            let mut line = Vec::new();
            // Bound the read so a peer cannot grow a single line unchecked.
            let mut bounded = (&mut self.reader).take(MAX_LINE_LEN as u64);
            let n = bounded.read_until(delim, &mut line).await?;
            if n == 0 {
                return Err(StreamError::Eof);
            }
            if line.last() != Some(&delim) {
                return if line.len() == MAX_LINE_LEN {
                    Err(StreamError::LineTooLong)
                } else {
                    Err(StreamError::Eof)
                };
            }
            String::from_utf8(line).map_err(|_| StreamError::InvalidUtf8)
        };
        with_deadline(timeout, read).await
    }

    /// Read exactly `n` bytes. A timeout of zero disables the deadline.
    pub async fn read_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, StreamError> {
        let read = async {
            let mut bytes = vec![0u8; n];
            self.reader.read_exact(&mut bytes).await?;
            Ok(bytes)
        };
        with_deadline(timeout, read).await
    }
}

/// Write half of a framed stream.
pub struct FramedWriter<S> {
    writer: WriteHalf<S>,
    peer: String,
}

impl<S: AsyncWrite + Unpin> FramedWriter<S> {
    /// Remote peer identifier, for logging.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Append raw bytes and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Append a string and flush.
    pub async fn send_string(&mut self, s: &str) -> Result<(), StreamError> {
        self.send(s.as_bytes()).await
    }

    /// Close the write side of the underlying stream.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.writer.close().await?;
        Ok(())
    }
}

/// A bidirectional transport stream with buffered, line-oriented framing and
/// the remote peer identifier attached for logging.
pub struct FramedStream<S> {
    reader: FramedReader<S>,
    writer: FramedWriter<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        let (read_half, write_half) = stream.split();
        Self {
            reader: FramedReader {
                reader: BufReader::new(read_half),
                peer: peer.clone(),
            },
            writer: FramedWriter {
                writer: write_half,
                peer,
            },
        }
    }

    /// Remote peer identifier, for logging.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.reader.peer
    }

    pub async fn read_string(
        &mut self,
        delim: u8,
        timeout: Duration,
    ) -> Result<String, StreamError> {
        self.reader.read_string(delim, timeout).await
    }

    pub async fn read_exact(
        &mut self,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, StreamError> {
        self.reader.read_exact(n, timeout).await
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.writer.send(bytes).await
    }

    pub async fn send_string(&mut self, s: &str) -> Result<(), StreamError> {
        self.writer.send_string(s).await
    }

    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.writer.close().await
    }

    /// Split into independently owned halves so a reader task and a writer
    /// can operate on the same stream concurrently.
    #[must_use]
    pub fn split(self) -> (FramedReader<S>, FramedWriter<S>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};

    fn pipe() -> (
        FramedStream<Compat<tokio::io::DuplexStream>>,
        FramedStream<Compat<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(1024);
        (
            FramedStream::new(a.compat(), "a"),
            FramedStream::new(b.compat(), "b"),
        )
    }

    #[tokio::test]
    async fn line_round_trip_keeps_delimiter() {
        let (mut a, mut b) = pipe();
        a.send_string("WANT META\nabc\n").await.expect("send");

        let verb = b.read_string(b'\n', Duration::ZERO).await.expect("verb");
        assert_eq!(verb, "WANT META\n");
        let arg = b.read_string(b'\n', Duration::ZERO).await.expect("arg");
        assert_eq!(arg, "abc\n");
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let (_a, mut b) = pipe();
        let err = b
            .read_string(b'\n', Duration::from_millis(20))
            .await
            .expect_err("no data was sent");
        assert!(matches!(err, StreamError::Timeout));
    }

    #[tokio::test]
    async fn clean_close_before_delimiter_is_eof() {
        let (mut a, mut b) = pipe();
        a.send_string("partial").await.expect("send");
        a.close().await.expect("close");

        let err = b
            .read_string(b'\n', Duration::ZERO)
            .await
            .expect_err("line was never terminated");
        assert!(matches!(err, StreamError::Eof));
    }

    #[tokio::test]
    async fn read_exact_gets_binary_payload() {
        let (mut a, mut b) = pipe();
        let payload = vec![0u8, 1, 2, 253, 254, 255];
        a.send(&payload).await.expect("send");

        let bytes = b
            .read_exact(payload.len(), Duration::from_secs(1))
            .await
            .expect("payload");
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn short_payload_is_eof() {
        let (mut a, mut b) = pipe();
        a.send(b"123").await.expect("send");
        a.close().await.expect("close");

        let err = b
            .read_exact(4, Duration::from_secs(1))
            .await
            .expect_err("payload was short");
        assert!(matches!(err, StreamError::Eof));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let (mut a, mut b) = pipe();
        let read = tokio::spawn(async move {
            let err = b
                .read_string(b'\n', Duration::ZERO)
                .await
                .expect_err("line exceeds the bound");
            assert!(matches!(err, StreamError::LineTooLong));
        });

        a.send(&vec![b'x'; MAX_LINE_LEN + 1]).await.expect("send");
        read.await.expect("reader task");
    }

    #[tokio::test]
    async fn split_halves_operate_concurrently() {
        let (a, mut b) = pipe();
        let (mut read, mut write) = a.split();

        write.send_string("MESSAGE\nhi\n").await.expect("send");
        assert_eq!(
            b.read_string(b'\n', Duration::ZERO).await.expect("verb"),
            "MESSAGE\n"
        );
        assert_eq!(
            b.read_string(b'\n', Duration::ZERO).await.expect("text"),
            "hi\n"
        );

        b.send_string("CLOSE\n").await.expect("send");
        assert_eq!(
            read.read_string(b'\n', Duration::ZERO).await.expect("verb"),
            "CLOSE\n"
        );
    }
}
