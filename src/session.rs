use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::poll_fn,
    io,
    net::SocketAddr,
    rc::Rc,
    task::{Poll, Waker},
};

use bytes::BytesMut;
use monoio::{buf::IoBuf, net::udp::UdpSocket};
use quiche::h3::{Event, NameValue};

use crate::{prelude::*, QuicStream};

/// Server-initiated bidirectional streams never carry HTTP/3 requests, so they
/// are free to serve as native duplex streams.
pub(crate) fn is_native_stream(stream_id: u64) -> bool {
    stream_id & 0x3 == 0x1
}

fn is_request_stream(stream_id: u64) -> bool {
    stream_id & 0x3 == 0x0
}

// 1xx header blocks precede the final response
fn is_informational(headers: &[quiche::h3::Header]) -> bool {
    headers
        .iter()
        .find(|h| h.name() == b":status")
        .map(|h| h.value().len() == 3 && h.value()[0] == b'1')
        .unwrap_or(false)
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

#[derive(Default)]
pub(crate) struct StreamState {
    pub(crate) headers: Option<Vec<quiche::h3::Header>>,
    body: BytesMut,
    fin: bool,
    reset: Option<u64>,
    read_shutdown: bool,
    readers: Vec<Waker>,
}

impl StreamState {
    fn wake(&mut self) {
        self.readers.drain(..).for_each(Waker::wake);
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.is_some()
    }

    pub(crate) fn register_reader(&mut self, waker: &Waker) {
        register(&mut self.readers, waker);
    }
}

/// What a round of processing found that the caller has to act on.
#[derive(Default)]
pub(crate) struct Processed {
    /// Client-initiated request streams whose headers just arrived.
    pub(crate) requests: Vec<u64>,
    /// Native streams the peer opened.
    pub(crate) hijacked: Vec<u64>,
}

/// Everything about one QUIC connection that the driver and the stream
/// handles share.
pub(crate) struct Session {
    pub(crate) quic: QuicheConnection,
    pub(crate) h3: Option<QuicheH3Connection>,
    pub(crate) streams: HashMap<u64, StreamState>,
    is_server: bool,
    next_native: u64,
    // bumped whenever the peer may have granted more send capacity
    generation: u64,
    writers: Vec<Waker>,
    detached: bool,
}

impl Session {
    pub(crate) fn new(quic: QuicheConnection, is_server: bool) -> Self {
        Self {
            quic,
            h3: None,
            streams: HashMap::new(),
            is_server,
            next_native: 1,
            generation: 0,
            writers: Vec::new(),
            detached: false,
        }
    }

    /// Closed, draining after a CONNECTION_CLOSE, or abandoned by the driver.
    pub(crate) fn is_closed(&self) -> bool {
        self.detached || self.quic.is_closed() || self.quic.is_draining()
    }

    pub(crate) fn start_h3(&mut self, config: &QuicheH3Config) -> crate::Result<()> {
        if self.h3.is_none() {
            self.h3 = Some(QuicheH3Connection::with_transport(&mut self.quic, config)?);
        }
        Ok(())
    }

    /// Pull everything quiche has buffered into per-stream state.
    ///
    /// Native streams are drained before the HTTP/3 layer polls, so it never
    /// sees them as readable.
    pub(crate) fn process(&mut self) -> crate::Result<Processed> {
        let mut processed = Processed::default();
        let mut buf = [0; 4096];

        let native: Vec<u64> = self
            .quic
            .readable()
            .filter(|id| is_native_stream(*id))
            .collect();
        for id in native {
            let known = self.streams.contains_key(&id);
            let state = self.streams.entry(id).or_default();
            if !known && !self.is_server {
                processed.hijacked.push(id);
            }
            loop {
                match self.quic.stream_recv(id, &mut buf) {
                    Ok((n, fin)) => {
                        state.body.extend_from_slice(&buf[..n]);
                        if fin {
                            state.fin = true;
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(quiche::Error::StreamReset(code)) => {
                        state.reset = Some(code);
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("native stream {id} read failed: {e}");
                        state.reset = Some(0);
                        break;
                    }
                }
            }
            state.wake();
        }

        let Some(h3) = self.h3.as_mut() else {
            return Ok(processed);
        };
        loop {
            match h3.poll(&mut self.quic) {
                Ok((id, Event::Headers { list, .. })) => {
                    if !self.is_server && is_informational(&list) {
                        tracing::debug!("skipping interim response on stream {id}");
                        continue;
                    }
                    let state = self.streams.entry(id).or_default();
                    // trailers are ignored
                    if state.headers.is_none() {
                        state.headers = Some(list);
                        if self.is_server && is_request_stream(id) {
                            processed.requests.push(id);
                        }
                    }
                    state.wake();
                }
                Ok((id, Event::Data)) => {
                    let state = self.streams.entry(id).or_default();
                    loop {
                        match h3.recv_body(&mut self.quic, id, &mut buf) {
                            Ok(n) => state.body.extend_from_slice(&buf[..n]),
                            Err(quiche::h3::Error::Done) => break,
                            Err(e) => {
                                tracing::debug!("body of stream {id} unreadable: {e}");
                                state.reset = Some(0);
                                break;
                            }
                        }
                    }
                    state.wake();
                }
                Ok((id, Event::Finished)) => {
                    let state = self.streams.entry(id).or_default();
                    state.fin = true;
                    state.wake();
                }
                Ok((id, Event::Reset(code))) => {
                    let state = self.streams.entry(id).or_default();
                    state.reset = Some(code);
                    state.wake();
                }
                Ok((_, Event::GoAway)) => {
                    tracing::debug!("peer sent GOAWAY");
                }
                Ok(_) => {}
                Err(quiche::h3::Error::Done) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(processed)
    }

    /// Let blocked writers retry, and readers notice a closed connection.
    pub(crate) fn wake_all(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.writers.drain(..).for_each(Waker::wake);
        if self.is_closed() {
            self.streams.values_mut().for_each(StreamState::wake);
        }
    }

    /// Mark the session as abandoned by its driver.
    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.wake_all();
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn poll_read(
        &mut self,
        stream_id: u64,
        out: &mut [u8],
        waker: &Waker,
    ) -> Poll<io::Result<usize>> {
        let closed = self.is_closed();
        let state = self.streams.entry(stream_id).or_default();
        if state.read_shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream read side is shut down",
            )));
        }
        if !state.body.is_empty() {
            let n = out.len().min(state.body.len());
            let chunk = state.body.split_to(n);
            out[..n].copy_from_slice(&chunk);
            return Poll::Ready(Ok(n));
        }
        if state.fin {
            return Poll::Ready(Ok(0));
        }
        if let Some(code) = state.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("stream {stream_id} reset by peer with code {code}"),
            )));
        }
        if closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )));
        }
        state.register_reader(waker);
        Poll::Pending
    }

    /// Stop reading `stream_id` and tell the peer so.
    pub(crate) fn shutdown_read(&mut self, stream_id: u64) {
        match self
            .quic
            .stream_shutdown(stream_id, quiche::Shutdown::Read, H3_NO_ERROR)
        {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => tracing::debug!("shutdown read of stream {stream_id}: {e}"),
        }
        let state = self.streams.entry(stream_id).or_default();
        state.read_shutdown = true;
        state.body.clear();
        state.wake();
    }

    /// Claim the next server-initiated bidirectional stream and send `data`
    /// on it.
    pub(crate) fn open_native(&mut self, data: &[u8]) -> crate::Result<u64> {
        let id = self.next_native;
        let written = self
            .quic
            .stream_send(id, data, false)
            .map_err(crate::Error::StreamOpenFailed)?;
        if written < data.len() {
            return Err(crate::Error::StreamOpenFailed(quiche::Error::StreamLimit));
        }
        self.next_native += 4;
        self.streams.entry(id).or_default();
        Ok(id)
    }

    pub(crate) fn peer_streams_left_bidi(&self) -> u64 {
        self.quic.peer_streams_left_bidi()
    }
}

/// Wakes a driver that is parked on a stale timer so it can pick up the one
/// quiche armed while sending.
#[derive(Default)]
pub(crate) struct Rearm {
    pending: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Rearm {
    pub(crate) fn notify(&self) {
        self.pending.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    pub(crate) fn reset(&self) {
        self.pending.set(false);
    }

    pub(crate) async fn notified(&self) {
        poll_fn(|cx| {
            if self.pending.replace(false) {
                return Poll::Ready(());
            }
            let mut slot = self.waker.borrow_mut();
            let waker = slot.get_or_insert_with(|| cx.waker().clone());
            if !waker.will_wake(cx.waker()) {
                *waker = cx.waker().clone();
            }
            Poll::Pending
        })
        .await
    }
}

type Hook = Box<dyn FnOnce(QuicStream)>;

/// A session plus the socket and addresses it is reached through.
pub(crate) struct Shared {
    pub(crate) state: RefCell<Session>,
    io: Rc<UdpSocket>,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    write_buffer: RefCell<Option<Box<[u8; MAX_DATAGRAM_SIZE]>>>,
    rearm: Rc<Rearm>,
    hook: RefCell<Option<Hook>>,
}

impl Shared {
    pub(crate) fn new(
        session: Session,
        io: Rc<UdpSocket>,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        rearm: Rc<Rearm>,
    ) -> Self {
        Self {
            state: RefCell::new(session),
            io,
            local,
            peer,
            write_buffer: RefCell::new(None),
            rearm,
            hook: RefCell::new(None),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub(crate) fn io(&self) -> &Rc<UdpSocket> {
        &self.io
    }

    pub(crate) fn rearm(&self) -> &Rc<Rearm> {
        &self.rearm
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    pub(crate) fn set_hook(&self, hook: Hook) {
        *self.hook.borrow_mut() = Some(hook);
    }

    /// Hand a native stream the peer opened to the hook, which fires at most
    /// once. Streams nobody claims are refused.
    pub(crate) fn hijack(self: &Rc<Self>, stream_id: u64) {
        let hook = self.hook.borrow_mut().take();
        match hook {
            Some(hook) => hook(QuicStream::new(self.clone(), stream_id)),
            None => {
                tracing::debug!("refusing unclaimed stream {stream_id}");
                self.state.borrow_mut().shutdown_read(stream_id);
            }
        }
    }

    pub(crate) async fn read(&self, stream_id: u64, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        poll_fn(|cx| {
            self.state
                .borrow_mut()
                .poll_read(stream_id, &mut *out, cx.waker())
        })
        .await
    }

    /// Wait until the peer may have granted capacity since `seen`.
    pub(crate) async fn writable(&self, seen: u64) -> io::Result<()> {
        poll_fn(|cx| {
            let mut session = self.state.borrow_mut();
            if session.is_closed() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed",
                )));
            }
            if session.generation != seen {
                return Poll::Ready(Ok(()));
            }
            register(&mut session.writers, cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Push everything quiche has queued out of the socket.
    pub(crate) async fn flush(&self) -> crate::Result<()> {
        let buffer = self
            .write_buffer
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Box::new([0; MAX_DATAGRAM_SIZE]));
        let (res, buffer) = write_io(buffer, &self.state, &self.io).await;
        *self.write_buffer.borrow_mut() = Some(buffer);
        self.rearm.notify();
        res
    }

    /// Close the whole QUIC connection with an application error code.
    pub(crate) async fn close(&self, err: u64, reason: &[u8]) -> crate::Result<()> {
        match self.state.borrow_mut().quic.close(true, err, reason) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => return Err(e.into()),
        }
        self.flush().await
    }
}

/// flush from session to socket, if there is nothing to send, return.
pub(crate) async fn write_io<const N: usize>(
    mut buffer: Box<[u8; N]>,
    session: &RefCell<Session>,
    io: &UdpSocket,
) -> (crate::Result<()>, Box<[u8; N]>) {
    loop {
        let res = session.borrow_mut().quic.send(&mut buffer[..]);
        match res {
            Ok((n, send_info)) => {
                let send_slice = buffer.slice(..n);
                let (res, buf) = io.send_to(send_slice, send_info.to).await;
                buffer = buf.into_inner();
                match res {
                    Ok(_) => continue,
                    Err(e) => {
                        return (Err(e.into()), buffer);
                    }
                }
            }
            Err(quiche::Error::Done) => {
                return (Ok(()), buffer);
            }
            Err(e) => {
                return (Err(e.into()), buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use quiche::h3::Header;

    use super::*;

    #[test]
    fn interim_statuses_are_informational() {
        let status = |code: &[u8]| vec![Header::new(b":status", code)];
        assert!(is_informational(&status(b"100")));
        assert!(is_informational(&status(b"103")));
        assert!(!is_informational(&status(b"200")));
        assert!(!is_informational(&status(b"1000")));
        assert!(!is_informational(&[Header::new(b":method", b"POST")]));
    }

    #[test]
    fn stream_kinds_by_id() {
        assert!(is_request_stream(0));
        assert!(is_request_stream(4));
        assert!(is_native_stream(1));
        assert!(is_native_stream(5));
        assert!(!is_native_stream(3));
        assert!(!is_request_stream(2));
    }
}
