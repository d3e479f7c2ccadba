use std::{io, net::SocketAddr, rc::Rc};

use crate::{prelude::*, session::Shared};

/// Incoming body of one HTTP/3 request stream.
pub struct RecvBody {
    shared: Rc<Shared>,
    stream_id: u64,
}

impl RecvBody {
    pub(crate) fn new(shared: Rc<Shared>, stream_id: u64) -> Self {
        Self { shared, stream_id }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Read body bytes; `Ok(0)` once the peer finished the body.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(self.stream_id, buf).await
    }

    /// Stop receiving. Pending and later reads fail.
    pub async fn close(&self) -> io::Result<()> {
        self.shared.state.borrow_mut().shutdown_read(self.stream_id);
        self.shared.flush().await.map_err(Into::into)
    }

    pub(crate) fn shutdown(&self) {
        self.shared.state.borrow_mut().shutdown_read(self.stream_id);
    }
}

/// Outgoing body of one HTTP/3 request stream.
///
/// Writes are queued into the QUIC session and only leave the socket on
/// [`flush`](Self::flush), or when a write has to wait for capacity.
pub struct SendBody {
    shared: Rc<Shared>,
    stream_id: u64,
}

impl SendBody {
    pub(crate) fn new(shared: Rc<Shared>, stream_id: u64) -> Self {
        Self { shared, stream_id }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.shared
            .send_body(self.stream_id, buf, false)
            .await
            .map_err(Into::into)
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.shared.flush().await.map_err(Into::into)
    }

    /// Finish the body and flush.
    pub async fn finish(&self) -> io::Result<()> {
        if !self.shared.is_closed() {
            self.shared.send_body(self.stream_id, &[], true).await?;
        }
        self.flush().await
    }

    pub(crate) async fn close_connection(&self) -> io::Result<()> {
        self.shared.close(0, b"").await.map_err(Into::into)
    }

    pub(crate) fn shutdown(&self) {
        let mut session = self.shared.state.borrow_mut();
        if let Err(e) = session
            .quic
            .stream_shutdown(self.stream_id, quiche::Shutdown::Write, H3_NO_ERROR)
        {
            tracing::debug!("shutdown write of stream {}: {e}", self.stream_id);
        }
    }
}

/// A raw bidirectional QUIC stream, outside of HTTP/3 framing.
///
/// Concurrent readers (or writers) on one handle are fine: each call takes
/// whatever bytes are available when it is polled.
pub struct QuicStream {
    shared: Rc<Shared>,
    stream_id: u64,
}

impl QuicStream {
    pub(crate) fn new(shared: Rc<Shared>, stream_id: u64) -> Self {
        Self { shared, stream_id }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr()
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.read(self.stream_id, buf).await
    }

    pub async fn read_exact(&self, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read(buf).await? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => buf = &mut std::mem::take(&mut buf)[n..],
            }
        }
        Ok(())
    }

    /// Write and flush right away.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.send(buf, false).await?;
        self.shared.flush().await?;
        Ok(n)
    }

    /// Shut down both directions: stop reading, send FIN.
    pub async fn close(&self) -> io::Result<()> {
        self.shared.state.borrow_mut().shutdown_read(self.stream_id);
        let fin = if self.shared.is_closed() {
            Ok(0)
        } else {
            self.send(&[], true).await
        };
        let flushed = self.shared.flush().await;
        fin?;
        flushed.map_err(Into::into)
    }

    pub(crate) fn shutdown(&self) {
        let mut session = self.shared.state.borrow_mut();
        session.shutdown_read(self.stream_id);
        if let Err(e) = session
            .quic
            .stream_shutdown(self.stream_id, quiche::Shutdown::Write, H3_NO_ERROR)
        {
            tracing::debug!("shutdown write of stream {}: {e}", self.stream_id);
        }
    }

    async fn send(&self, buf: &[u8], fin: bool) -> io::Result<usize> {
        loop {
            let (res, seen) = {
                let mut session = self.shared.state.borrow_mut();
                let res = session.quic.stream_send(self.stream_id, buf, fin);
                (res, session.generation())
            };
            match res {
                // fin with an empty buffer reports 0 and is done
                Ok(n) if n > 0 || buf.is_empty() => return Ok(n),
                Ok(_) | Err(quiche::Error::Done) => {
                    self.shared.flush().await?;
                    self.shared.writable(seen).await?;
                }
                Err(e) => return Err(crate::Error::from(e).into()),
            }
        }
    }
}
