use std::{future::poll_fn, io, task::Poll};

use quiche::h3::NameValue;

use crate::session::{Session, Shared};

impl Shared {
    /// Run an HTTP/3 send operation, waiting for capacity while it reports
    /// `Done` or `StreamBlocked`.
    async fn send_h3<R>(
        &self,
        mut op: impl FnMut(&mut Session) -> quiche::h3::Result<R>,
    ) -> crate::Result<R> {
        loop {
            let (res, seen) = {
                let mut session = self.state.borrow_mut();
                let res = op(&mut *session);
                (res, session.generation())
            };
            match res {
                Ok(r) => return Ok(r),
                Err(quiche::h3::Error::Done) | Err(quiche::h3::Error::StreamBlocked) => {
                    self.flush().await?;
                    self.writable(seen).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn send_request<T: NameValue>(
        &self,
        headers: &[T],
        fin: bool,
    ) -> crate::Result<u64> {
        let sid = self
            .send_h3(|session| {
                let Session { quic, h3, .. } = session;
                match h3 {
                    Some(h3) => h3.send_request(quic, headers, fin),
                    None => Err(quiche::h3::Error::InternalError),
                }
            })
            .await?;
        self.flush().await?;
        Ok(sid)
    }

    pub(crate) async fn send_response<T: NameValue>(
        &self,
        stream_id: u64,
        headers: &[T],
        fin: bool,
    ) -> crate::Result<()> {
        self.send_h3(|session| {
            let Session { quic, h3, .. } = session;
            match h3 {
                Some(h3) => h3.send_response(quic, stream_id, headers, fin),
                None => Err(quiche::h3::Error::InternalError),
            }
        })
        .await?;
        self.flush().await
    }

    /// Queue body bytes without flushing; returns how many were accepted.
    pub(crate) async fn send_body(
        &self,
        stream_id: u64,
        body: &[u8],
        fin: bool,
    ) -> crate::Result<usize> {
        self.send_h3(|session| {
            let Session { quic, h3, .. } = session;
            match h3 {
                Some(h3) => h3.send_body(quic, stream_id, body, fin),
                None => Err(quiche::h3::Error::InternalError),
            }
        })
        .await
    }

    /// Wait for the header block of `stream_id`.
    pub(crate) async fn headers(&self, stream_id: u64) -> crate::Result<Vec<quiche::h3::Header>> {
        poll_fn(|cx| {
            let mut session = self.state.borrow_mut();
            let closed = session.is_closed();
            let state = session.streams.entry(stream_id).or_default();
            if let Some(headers) = &state.headers {
                return Poll::Ready(Ok(headers.clone()));
            }
            if state.is_reset() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("stream {stream_id} reset before headers"),
                )
                .into()));
            }
            if closed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed before headers",
                )
                .into()));
            }
            state.register_reader(cx.waker());
            Poll::Pending
        })
        .await
    }
}
