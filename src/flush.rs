use std::io;

use crate::SendBody;

/// What closing a [`FlushingWriter`] tears down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloseMode {
    /// Finish the body stream.
    #[default]
    Stream,
    /// Close the whole QUIC connection with error code 0.
    Connection,
}

/// Body writer that puts every write on the wire immediately.
pub struct FlushingWriter {
    body: SendBody,
    close: CloseMode,
}

impl FlushingWriter {
    pub fn new(body: SendBody, close: CloseMode) -> Self {
        Self { body, close }
    }

    /// Write through to the body, then flush even if the write failed or
    /// was partial.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let written = self.body.write(buf).await;
        let flushed = self.body.flush().await;
        let n = written?;
        flushed?;
        Ok(n)
    }

    pub async fn close(&self) -> io::Result<()> {
        match self.close {
            CloseMode::Stream => self.body.finish().await,
            CloseMode::Connection => self.body.close_connection().await,
        }
    }

    pub(crate) fn shutdown(&self) {
        self.body.shutdown();
    }
}
