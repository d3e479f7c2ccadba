use std::{
    cell::RefCell,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    rc::Rc,
    time::Duration,
};

use local_sync::oneshot;
use monoio::{io::Canceller, net::udp::UdpSocket};
use quiche::ConnectionId;

use crate::{
    prelude::*,
    session::{write_io, Rearm, Session, Shared},
    QuicStream,
};

/// A dialed QUIC connection whose packets are driven by a background task.
///
/// The task lives as long as this handle; dropping it closes the connection
/// with code 0.
pub struct Connection {
    shared: Rc<Shared>,
    _read_task: oneshot::Receiver<()>,
}

impl Connection {
    pub async fn connect<'a, A: ToSocketAddrs>(
        addr: A,
        server_name: Option<&str>,
        scid: &ConnectionId<'a>,
        config: &mut QuicheConfig,
    ) -> crate::Result<Self> {
        let peer_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "empty address"))?;
        let bind_addr = match peer_addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        Self::connect_with_addr(server_name, scid, bind_addr, peer_addr, config).await
    }

    pub async fn connect_with_addr<'a>(
        server_name: Option<&str>,
        scid: &ConnectionId<'a>,
        local: SocketAddr,
        peer: SocketAddr,
        config: &mut QuicheConfig,
    ) -> crate::Result<Self> {
        let socket = Rc::new(UdpSocket::bind(local)?);
        let local_addr = socket.local_addr()?;
        let conn = quiche::connect(server_name, scid, local_addr, peer, config)?;
        let session = RefCell::new(Session::new(conn, false));
        let buffer = Self::handshake(&session, &socket, local_addr).await?;
        tracing::debug!("quic handshake with {peer} done");

        let shared = Rc::new(Shared::new(
            session.into_inner(),
            socket,
            Some(local_addr),
            peer,
            Rc::new(Rearm::default()),
        ));
        let read_task = Self::start_read_task(local_addr, shared.clone(), buffer);
        Ok(Self {
            shared,
            _read_task: read_task,
        })
    }

    /// Exchange packets until the connection is established, handing back
    /// the datagram buffer for the read task.
    async fn handshake(
        session: &RefCell<Session>,
        socket: &UdpSocket,
        local_addr: SocketAddr,
    ) -> crate::Result<Box<[u8; MAX_DATAGRAM_SIZE]>> {
        let mut buffer = Box::new([0; MAX_DATAGRAM_SIZE]);
        let mut canceller = Canceller::new();
        loop {
            let (res, buf) = write_io(buffer, session, socket).await;
            buffer = buf;
            res?;

            {
                let session = session.borrow();
                if session.quic.is_closed() {
                    return Err(crate::Error::Quiche(quiche::Error::InvalidState));
                }
                if session.quic.is_established() {
                    return Ok(buffer);
                }
            }

            let timeout = session.borrow().quic.timeout();
            let recv = socket.cancelable_recv_from(buffer, canceller.handle());
            let sleep = sleep_for(timeout);
            crate::pin!(recv, sleep);
            let received = monoio::select! {
                (res, buf) = &mut recv => {
                    buffer = buf;
                    Some(res?)
                },
                _ = &mut sleep => {
                    canceller = canceller.cancel();
                    let (res, buf) = recv.await;
                    buffer = buf;
                    if res.is_err() {
                        session.borrow_mut().quic.on_timeout();
                    }
                    res.ok()
                }
            };
            if let Some((len, from)) = received {
                let recv_info = quiche::RecvInfo {
                    to: local_addr,
                    from,
                };
                session.borrow_mut().quic.recv(&mut buffer[..len], recv_info)?;
            }
        }
    }

    /// Start HTTP/3 on top of the established connection.
    pub fn start_h3(&self, config: &QuicheH3Config) -> crate::Result<()> {
        self.shared.state.borrow_mut().start_h3(config)
    }

    /// Register the hook that receives the first bidirectional stream the
    /// peer opens. It fires at most once; later streams are refused.
    pub fn on_stream(&self, hook: impl FnOnce(QuicStream) + 'static) {
        self.shared.set_hook(Box::new(hook));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr().unwrap_or(crate::UNKNOWN_ADDR)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.shared
    }

    pub async fn close(&self, err: u64, reason: &[u8]) -> crate::Result<()> {
        self.shared.close(err, reason).await
    }

    fn start_read_task(
        local_addr: SocketAddr,
        shared: Rc<Shared>,
        buffer: Box<[u8; MAX_DATAGRAM_SIZE]>,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        monoio::spawn(async move {
            let res = Self::read_loop(tx, local_addr, &shared, buffer).await;
            shared.state.borrow_mut().detach();
            tracing::info!("read task exit {res:?}");
        });
        rx
    }

    async fn read_loop(
        mut notified: oneshot::Sender<()>,
        local_addr: SocketAddr,
        shared: &Rc<Shared>,
        mut buffer: Box<[u8; MAX_DATAGRAM_SIZE]>,
    ) -> crate::Result<()> {
        let socket = shared.io().clone();
        let rearm = shared.rearm().clone();
        let mut canceller = Canceller::new();
        let exit = notified.closed();
        crate::pin!(exit);

        loop {
            rearm.reset();
            let timeout = shared.state.borrow().quic.timeout();
            let recv = socket.cancelable_recv_from(buffer, canceller.handle());
            let sleep = sleep_for(timeout);
            let rearmed = rearm.notified();
            crate::pin!(recv, sleep, rearmed);
            let received = monoio::select! {
                (res, buf) = &mut recv => {
                    buffer = buf;
                    Some(res?)
                },
                _ = &mut sleep => {
                    canceller = canceller.cancel();
                    let (res, buf) = recv.await;
                    buffer = buf;
                    match res {
                        Ok(r) => Some(r),
                        Err(_) => {
                            shared.state.borrow_mut().quic.on_timeout();
                            None
                        }
                    }
                },
                _ = &mut rearmed => {
                    canceller = canceller.cancel();
                    let (res, buf) = recv.await;
                    buffer = buf;
                    res.ok()
                },
                _ = &mut exit => {
                    // the handle is gone: say goodbye before leaving
                    let _ = shared.state.borrow_mut().quic.close(true, 0, b"");
                    let goodbye = Box::new([0; MAX_DATAGRAM_SIZE]);
                    let (res, _) = write_io(goodbye, &shared.state, &socket).await;
                    return res;
                }
            };

            let hijacked = {
                let mut session = shared.state.borrow_mut();
                if let Some((len, from)) = received {
                    let recv_info = quiche::RecvInfo {
                        to: local_addr,
                        from,
                    };
                    if let Err(e) = session.quic.recv(&mut buffer[..len], recv_info) {
                        tracing::debug!("dropping packet from {from}: {e}");
                    }
                }
                let processed = session.process();
                session.wake_all();
                processed?.hijacked
            };
            for stream_id in hijacked {
                shared.hijack(stream_id);
            }

            let (res, buf) = write_io(buffer, &shared.state, &socket).await;
            buffer = buf;
            res?;

            if shared.state.borrow().quic.is_closed() {
                return Ok(());
            }
        }
    }
}

pub(crate) async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => monoio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
