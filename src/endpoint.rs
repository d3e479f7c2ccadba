use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, ToSocketAddrs},
    rc::Rc,
};

use futures::{channel::mpsc, StreamExt};
use local_sync::oneshot;
use monoio::{io::Canceller, net::udp::UdpSocket};
use quiche::ConnectionId;
use rand::RngCore;

use crate::{
    connection::sleep_for,
    prelude::*,
    server::{Exchange, Version},
    session::{write_io, Rearm, Session, Shared},
    ServerConfig,
};

/// An HTTP/3 server endpoint yielding one [`Exchange`] per inbound request.
///
/// [`bind`](Self::bind) spawns the endpoint driver, so it has to be called
/// inside a monoio runtime. Connections accepted by the listener are driven by its background task,
/// so the listener has to outlive the streams upgraded from its exchanges.
pub struct Listener {
    local: SocketAddr,
    incoming: mpsc::UnboundedReceiver<Exchange>,
    _driver: oneshot::Receiver<()>,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: &ServerConfig) -> crate::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "empty address"))?;
        let socket = Rc::new(UdpSocket::bind(addr)?);
        let local = socket.local_addr()?;
        let (tx, incoming) = mpsc::unbounded();
        let (notified, driver) = oneshot::channel();

        let endpoint = Endpoint {
            socket,
            local,
            config: config.quiche_config()?,
            h3_config: QuicheH3Config::new()?,
            routes: HashMap::new(),
            sessions: Vec::new(),
            incoming: tx,
            rearm: Rc::new(Rearm::default()),
        };
        monoio::spawn(async move {
            let res = endpoint.run(notified).await;
            tracing::info!("listener on {local} exit {res:?}");
        });
        tracing::info!("listening on {local}");

        Ok(Self {
            local,
            incoming,
            _driver: driver,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Next inbound request, or `None` once the endpoint stopped.
    pub async fn next(&mut self) -> Option<Exchange> {
        self.incoming.next().await
    }
}

struct Endpoint {
    socket: Rc<UdpSocket>,
    local: SocketAddr,
    config: QuicheConfig,
    h3_config: QuicheH3Config,
    // every connection id the peer may address us with
    routes: HashMap<Vec<u8>, Rc<Shared>>,
    sessions: Vec<Rc<Shared>>,
    incoming: mpsc::UnboundedSender<Exchange>,
    rearm: Rc<Rearm>,
}

impl Endpoint {
    async fn run(mut self, mut notified: oneshot::Sender<()>) -> crate::Result<()> {
        let mut buffer = Box::new([0; MAX_DATAGRAM_SIZE]);
        let mut canceller = Canceller::new();
        let socket = self.socket.clone();
        let rearm = self.rearm.clone();
        let exit = notified.closed();
        crate::pin!(exit);

        let res = loop {
            rearm.reset();
            let timeout = self
                .sessions
                .iter()
                .filter_map(|shared| shared.state.borrow().quic.timeout())
                .min();
            let recv = socket.cancelable_recv_from(buffer, canceller.handle());
            let sleep = sleep_for(timeout);
            let rearmed = rearm.notified();
            crate::pin!(recv, sleep, rearmed);
            let received = monoio::select! {
                (res, buf) = &mut recv => {
                    buffer = buf;
                    match res {
                        Ok(r) => Some(r),
                        Err(e) => break Err(e.into()),
                    }
                },
                _ = &mut sleep => {
                    canceller = canceller.cancel();
                    let (res, buf) = recv.await;
                    buffer = buf;
                    if res.is_err() {
                        for shared in &self.sessions {
                            shared.state.borrow_mut().quic.on_timeout();
                        }
                    }
                    res.ok()
                },
                _ = &mut rearmed => {
                    canceller = canceller.cancel();
                    let (res, buf) = recv.await;
                    buffer = buf;
                    res.ok()
                },
                _ = &mut exit => break Ok(()),
            };

            if let Some((len, from)) = received {
                self.receive(&mut buffer[..len], from).await;
            }

            // flush every session, then forget the ones that are gone
            for shared in &self.sessions {
                let (res, buf) = write_io(buffer, &shared.state, &self.socket).await;
                buffer = buf;
                if let Err(e) = res {
                    tracing::debug!("flush to {} failed: {e}", shared.peer_addr());
                }
            }
            self.sessions.retain(|shared| {
                let mut session = shared.state.borrow_mut();
                session.wake_all();
                !session.is_closed()
            });
            self.routes.retain(|_, shared| !shared.is_closed());
        };

        // the listener is gone: close every connection before leaving
        let mut goodbye = Box::new([0; MAX_DATAGRAM_SIZE]);
        for shared in &self.sessions {
            let _ = shared.state.borrow_mut().quic.close(true, 0, b"");
            let (_, buf) = write_io(goodbye, &shared.state, &self.socket).await;
            goodbye = buf;
            shared.state.borrow_mut().detach();
        }
        res
    }

    async fn receive(&mut self, packet: &mut [u8], from: SocketAddr) {
        let header = quiche::Header::from_slice(packet, quiche::MAX_CONN_ID_LEN);
        let (ty, version, dcid, scid) = match header {
            Ok(hdr) => (hdr.ty, hdr.version, hdr.dcid.to_vec(), hdr.scid.to_vec()),
            Err(e) => {
                tracing::debug!("unparsable packet from {from}: {e}");
                return;
            }
        };

        let shared = match self.routes.get(&dcid) {
            Some(shared) => shared.clone(),
            None => {
                if ty != quiche::Type::Initial {
                    tracing::debug!("packet for unknown connection from {from}");
                    return;
                }
                if !quiche::version_is_supported(version) {
                    self.negotiate_version(&scid, &dcid, from).await;
                    return;
                }
                match self.accept(&dcid, from) {
                    Ok(shared) => shared,
                    Err(e) => {
                        tracing::warn!("failed to accept connection from {from}: {e}");
                        return;
                    }
                }
            }
        };

        let requests = {
            let mut session = shared.state.borrow_mut();
            let recv_info = quiche::RecvInfo {
                to: self.local,
                from,
            };
            if let Err(e) = session.quic.recv(packet, recv_info) {
                tracing::debug!("dropping packet from {from}: {e}");
                return;
            }
            let ready = session.quic.is_established() || session.quic.is_in_early_data();
            if session.h3.is_none() && ready {
                if let Err(e) = session.start_h3(&self.h3_config) {
                    tracing::warn!("failed to start h3 with {from}: {e}");
                    return;
                }
            }
            match session.process() {
                Ok(processed) => processed.requests,
                Err(e) => {
                    tracing::debug!("h3 error from {from}: {e}");
                    Vec::new()
                }
            }
        };

        for stream_id in requests {
            let headers = shared
                .state
                .borrow()
                .streams
                .get(&stream_id)
                .and_then(|state| state.headers.clone())
                .unwrap_or_default();
            let exchange = Exchange::new(shared.clone(), stream_id, headers, Version::HTTP_3);
            if self.incoming.unbounded_send(exchange).is_err() {
                tracing::debug!("listener dropped, ignoring request {stream_id}");
            }
        }
    }

    fn accept(&mut self, odcid: &[u8], from: SocketAddr) -> crate::Result<Rc<Shared>> {
        let mut scid = [0; quiche::MAX_CONN_ID_LEN];
        rand::thread_rng().fill_bytes(&mut scid);
        let conn = quiche::accept(
            &ConnectionId::from_ref(&scid),
            None,
            self.local,
            from,
            &mut self.config,
        )?;
        tracing::debug!("accepted connection from {from}");
        let shared = Rc::new(Shared::new(
            Session::new(conn, true),
            self.socket.clone(),
            Some(self.local),
            from,
            self.rearm.clone(),
        ));
        self.routes.insert(odcid.to_vec(), shared.clone());
        self.routes.insert(scid.to_vec(), shared.clone());
        self.sessions.push(shared.clone());
        Ok(shared)
    }

    async fn negotiate_version(&self, scid: &[u8], dcid: &[u8], to: SocketAddr) {
        let mut out = vec![0; MAX_DATAGRAM_SIZE];
        let len = match quiche::negotiate_version(
            &ConnectionId::from_ref(scid),
            &ConnectionId::from_ref(dcid),
            &mut out,
        ) {
            Ok(len) => len,
            Err(e) => {
                tracing::debug!("version negotiation failed: {e}");
                return;
            }
        };
        out.truncate(len);
        let (res, _) = self.socket.send_to(out, to).await;
        if let Err(e) = res {
            tracing::debug!("version negotiation to {to} failed: {e}");
        }
    }
}
