//! Byte-stream abstraction consumed by the connection
//!
//! The connection never touches sockets directly; it drives anything that
//! implements [`WsStream`]. Timeouts are the policy of the stream
//! implementation and surface here as I/O errors.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Byte-level duplex contract between the connection and its transport
#[allow(async_fn_in_trait)]
pub trait WsStream {
    /// Read whatever is available into `buf`.
    ///
    /// Waits until at least one byte can be delivered; returns 0 only at end
    /// of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes, failing on end of stream
    async fn read_exactly(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush buffered writes down to the transport
    async fn flush(&mut self) -> Result<()>;

    /// Whether the stream is still usable
    fn connected(&self) -> bool;

    /// Shut the stream down; subsequent reads and writes fail
    async fn close(&mut self) -> Result<()>;
}

/// [`WsStream`] adapter for any tokio async transport
#[derive(Debug)]
pub struct TokioStream<T> {
    inner: T,
    connected: bool,
}

impl<T> TokioStream<T> {
    /// Wrap an already-connected transport
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            connected: true,
        }
    }

    /// Get a reference to the underlying transport
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the adapter and return the transport
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> WsStream for TokioStream<T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf).await?;
        if n == 0 && !buf.is_empty() {
            self.connected = false;
        }
        Ok(n)
    }

    async fn read_exactly(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Err(e) = self.inner.read_exact(buf).await {
            self.connected = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Err(e) = self.inner.write_all(data).await {
            self.connected = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// In-memory scripted stream used by wire-level tests
#[cfg(test)]
pub(crate) mod mock {
    use std::io;

    use super::*;

    /// Feeds pre-scripted input and records everything written
    pub struct MockStream {
        input: Vec<u8>,
        pos: usize,
        pub written: Vec<u8>,
        pub open: bool,
        pub fail_writes: bool,
    }

    impl MockStream {
        pub fn new(input: Vec<u8>) -> Self {
            Self {
                input,
                pos: 0,
                written: Vec::new(),
                open: true,
                fail_writes: false,
            }
        }

        pub fn empty() -> Self {
            Self::new(Vec::new())
        }

        fn eof(&self) -> io::Error {
            io::Error::new(io::ErrorKind::UnexpectedEof, "mock input exhausted")
        }
    }

    impl WsStream for MockStream {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let remaining = self.input.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        async fn read_exactly(&mut self, buf: &mut [u8]) -> Result<()> {
            if self.input.len() - self.pos < buf.len() {
                self.open = false;
                return Err(self.eof().into());
            }
            buf.copy_from_slice(&self.input[self.pos..self.pos + buf.len()]);
            self.pos += buf.len();
            Ok(())
        }

        async fn write(&mut self, data: &[u8]) -> Result<()> {
            if self.fail_writes || !self.open {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure").into());
            }
            self.written.extend_from_slice(data);
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn connected(&self) -> bool {
            self.open
        }

        async fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_adapter_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = TokioStream::new(a);
        let mut right = TokioStream::new(b);

        left.write(b"ping over duplex").await.unwrap();
        left.flush().await.unwrap();

        let mut buf = [0u8; 16];
        right.read_exactly(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over duplex");
        assert!(right.connected());
    }

    #[tokio::test]
    async fn tokio_adapter_eof_marks_disconnected() {
        let (a, b) = tokio::io::duplex(64);
        let mut right = TokioStream::new(b);
        drop(a);

        let mut buf = [0u8; 4];
        assert!(right.read_exactly(&mut buf).await.is_err());
        assert!(!right.connected());
    }

    #[tokio::test]
    async fn mock_stream_scripted_io() {
        let mut stream = mock::MockStream::new(vec![1, 2, 3, 4]);

        let mut head = [0u8; 2];
        stream.read_exactly(&mut head).await.unwrap();
        assert_eq!(head, [1, 2]);

        let mut rest = [0u8; 4];
        let n = stream.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], &[3, 4]);

        assert!(stream.read_exactly(&mut head).await.is_err());
    }
}
