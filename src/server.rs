//! Server side of the negotiation.
//!
//! A request handler takes each [`Exchange`] from a
//! [`Listener`](crate::Listener) and either upgrades it with [`accept`] (or a
//! configured [`Upgrader`]) or turns it down with [`Exchange::respond`].

use std::{cell::Cell, fmt, net::SocketAddr, rc::Rc};

use quiche::h3::{Header, NameValue};

use crate::{
    prelude::*,
    session::Shared,
    CloseMode, DuplexStream, FlushingWriter, QuicStream, RecvBody, SendBody, Strategy,
};

/// Protocol version of an inbound exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_3: Version = Version { major: 3, minor: 0 };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// One inbound request, not answered yet.
pub struct Exchange {
    shared: Rc<Shared>,
    stream_id: u64,
    headers: Vec<Header>,
    version: Version,
    responded: Cell<bool>,
}

impl Exchange {
    pub(crate) fn new(
        shared: Rc<Shared>,
        stream_id: u64,
        headers: Vec<Header>,
        version: Version,
    ) -> Self {
        Self {
            shared,
            stream_id,
            headers,
            version,
            responded: Cell::new(false),
        }
    }

    pub fn method(&self) -> Option<&[u8]> {
        self.header(b":method")
    }

    pub fn path(&self) -> Option<&[u8]> {
        self.header(b":path")
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
            .map(|h| h.value())
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr()
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn responded(&self) -> bool {
        self.responded.get()
    }

    /// Answer with `status` and no body, e.g. to decline the negotiation.
    pub async fn respond(&self, status: u16) -> crate::Result<()> {
        self.claim()?;
        let headers = [Header::new(b":status", status.to_string().as_bytes())];
        self.shared
            .send_response(self.stream_id, &headers, true)
            .await
    }

    fn claim(&self) -> crate::Result<()> {
        if self.responded.replace(true) {
            return Err(crate::Error::Protocol("exchange already answered"));
        }
        Ok(())
    }

    /// Which duplex strategies the underlying connection can still serve.
    fn capabilities(&self) -> Capabilities {
        let session = self.shared.state.borrow();
        let data_stream = session
            .streams
            .get(&self.stream_id)
            .map(|state| !state.is_reset())
            .unwrap_or(false);
        Capabilities {
            flush: !session.is_closed(),
            data_stream,
            open_stream: session.peer_streams_left_bidi() > 0,
        }
    }

    fn requested_strategy(&self) -> crate::Result<Strategy> {
        match self.header(MODE_HEADER) {
            None => Ok(Strategy::Split),
            Some(value) => Strategy::from_header(value)
                .ok_or(crate::Error::UnsupportedProtocol("unknown duplex mode")),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("stream_id", &self.stream_id)
            .field("peer", &self.shared.peer_addr())
            .field("version", &self.version)
            .finish()
    }
}

struct Capabilities {
    flush: bool,
    data_stream: bool,
    open_stream: bool,
}

impl Capabilities {
    fn supports(&self, strategy: Strategy) -> bool {
        self.flush
            && match strategy {
                Strategy::Split => self.data_stream,
                Strategy::Native => self.open_stream,
            }
    }
}

/// Turns inbound exchanges into [`DuplexStream`]s.
#[derive(Debug, Clone, Copy)]
pub struct Upgrader {
    status: u16,
    min_version: Version,
    close_mode: CloseMode,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new()
    }
}

impl Upgrader {
    pub const fn new() -> Self {
        Self {
            status: 200,
            min_version: Version::HTTP_3,
            close_mode: CloseMode::Stream,
        }
    }

    /// Success status sent once the stream is ready. Must be 2xx.
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub const fn with_min_version(mut self, version: Version) -> Self {
        self.min_version = version;
        self
    }

    /// What closing the server's write side does in split mode.
    pub const fn with_close_mode(mut self, mode: CloseMode) -> Self {
        self.close_mode = mode;
        self
    }

    /// Upgrade `exchange` to a duplex stream.
    ///
    /// Nothing is written to the peer unless this succeeds, so a failed
    /// exchange can still be answered with [`Exchange::respond`].
    pub async fn accept(&self, exchange: &Exchange) -> crate::Result<DuplexStream> {
        if exchange.responded() {
            return Err(crate::Error::Protocol("exchange already answered"));
        }
        if exchange.version() < self.min_version {
            return Err(crate::Error::UnsupportedProtocol("protocol version too old"));
        }
        let strategy = exchange.requested_strategy()?;
        if !exchange.capabilities().supports(strategy) {
            return Err(crate::Error::UnsupportedProtocol(
                "connection cannot carry the requested duplex mode",
            ));
        }
        let local = exchange.local_addr().ok_or(crate::Error::AddressUnavailable)?;
        let peer = exchange.peer_addr();
        let shared = exchange.shared.clone();
        let stream_id = exchange.stream_id;
        let status = [Header::new(b":status", self.status.to_string().as_bytes())];

        let duplex = match strategy {
            Strategy::Split => {
                let reader = RecvBody::new(shared.clone(), stream_id);
                let writer = FlushingWriter::new(
                    SendBody::new(shared.clone(), stream_id),
                    self.close_mode,
                );
                let duplex = DuplexStream::split(reader, writer).with_addrs(Some(local), Some(peer));
                exchange.claim()?;
                // the body stays open: it is the server's write side
                shared.send_response(stream_id, &status, false).await?;
                duplex
            }
            Strategy::Native => {
                let mut marker = [0; MARKER_LEN];
                marker[..4].copy_from_slice(MARKER_TAG);
                marker[4..].copy_from_slice(&stream_id.to_be_bytes());
                let native = shared.state.borrow_mut().open_native(&marker)?;
                let duplex = DuplexStream::native(QuicStream::new(shared.clone(), native))
                    .with_addrs(Some(local), Some(peer));
                exchange.claim()?;
                shared.send_response(stream_id, &status, true).await?;
                duplex
            }
        };
        tracing::debug!(
            "upgraded request {stream_id} from {peer} to a {strategy:?} duplex stream"
        );
        Ok(duplex)
    }
}

static DEFAULT_UPGRADER: Upgrader = Upgrader::new();

/// Upgrade `exchange` with the default [`Upgrader`].
pub async fn accept(exchange: &Exchange) -> crate::Result<DuplexStream> {
    DEFAULT_UPGRADER.accept(exchange).await
}
