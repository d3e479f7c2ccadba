//! Client side of the negotiation.

use std::{
    collections::HashMap,
    future::{poll_fn, Future},
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    rc::Rc,
    sync::OnceLock,
    task::Poll,
    time::{Duration, Instant},
};

use quiche::{
    h3::{Header, NameValue},
    ConnectionId,
};
use rand::RngCore;
use url::{Position, Url};

use crate::{
    addr::{parse_locator, TargetAddr},
    prelude::*,
    rendezvous::Rendezvous,
    session::Shared,
    CloseMode, Connection, DuplexStream, FlushingWriter, QuicStream, RecvBody, SendBody, Strategy,
    TransportConfig, Trust,
};

/// Status and headers the server answered the negotiation with.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<Header>,
}

impl Response {
    pub(crate) fn new(status: u16, headers: Vec<Header>) -> Self {
        Self { status, headers }
    }

    fn from_headers(headers: Vec<Header>) -> crate::Result<Self> {
        let status = headers
            .iter()
            .find(|h| h.name() == b":status")
            .and_then(|h| std::str::from_utf8(h.value()).ok())
            .and_then(|s| s.parse().ok())
            .ok_or(crate::Error::Protocol("response without a valid :status"))?;
        Ok(Self::new(status, headers))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
            .map(|h| h.value())
    }

    /// Any 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub trust: Trust,
    pub transport: TransportConfig,
    pub strategy: Strategy,
    resolve: HashMap<String, SocketAddr>,
}

impl ClientConfig {
    pub fn with_trust(mut self, trust: Trust) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Dial `addr` whenever a locator names `host`, skipping DNS.
    pub fn resolve(mut self, host: &str, addr: SocketAddr) -> Self {
        self.resolve.insert(host.to_ascii_lowercase(), addr);
        self
    }
}

/// Dials duplex streams with one fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dial `locator`, negotiate a duplex stream and return it together with
    /// the server's response.
    ///
    /// `timeout` starts once the QUIC connection is up and bounds the
    /// negotiation plus, in native mode, the arrival of the server's stream.
    /// A non-2xx answer fails with
    /// [`HandshakeRejected`](crate::Error::HandshakeRejected), which carries
    /// the response.
    pub async fn connect<T: NameValue>(
        &self,
        locator: &str,
        headers: &[T],
        timeout: Duration,
    ) -> crate::Result<(DuplexStream, Response)> {
        let url = parse_locator(locator)?;
        let target = TargetAddr::from_url(&url)?;
        let peer = self.lookup(&target)?;
        let conn = self.dial(&target, peer).await?;
        conn.start_h3(&QuicheH3Config::new()?)?;
        tracing::debug!("connected to {target} at {peer}");

        let strategy = self.config.strategy;
        let mut rendezvous = match strategy {
            Strategy::Split => None,
            Strategy::Native => {
                let (rendezvous, ready) = Rendezvous::new();
                let hook = rendezvous.clone();
                conn.on_stream(move |stream| {
                    if let Err(stream) = hook.signal(stream) {
                        tracing::debug!("dropping late stream {}", stream.stream_id());
                        stream.shutdown();
                    }
                });
                Some((rendezvous, ready))
            }
        };

        let request = request_headers(&url, &target, strategy, headers);
        let deadline = Instant::now() + timeout;
        let outcome = {
            let expired = monoio::time::sleep(timeout);
            let negotiate = async {
                let shared = conn.shared();
                let stream_id = shared.send_request(&request, false).await?;
                let response = Response::from_headers(shared.headers(stream_id).await?)?;
                if !response.is_success() {
                    return Err(crate::Error::HandshakeRejected {
                        status: response.status(),
                        response,
                    });
                }
                let native = match rendezvous {
                    Some((_, ref mut ready)) => {
                        let stream = ready
                            .await
                            .map_err(|_| crate::Error::StreamAcquisitionTimeout)?;
                        verify_marker(&stream, stream_id).await?;
                        SendBody::new(shared.clone(), stream_id).finish().await?;
                        Some(stream)
                    }
                    None => None,
                };
                Ok((stream_id, response, native))
            };
            crate::pin!(expired, negotiate);
            // the deadline wins ties
            poll_fn(|cx| {
                if Instant::now() >= deadline || expired.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(None);
                }
                negotiate.as_mut().poll(cx).map(Some)
            })
            .await
        };

        let Some(negotiated) = outcome else {
            if let Some((rendezvous, _)) = &rendezvous {
                if !rendezvous.cancel() {
                    tracing::debug!("native stream from {target} arrived with the deadline");
                }
            }
            tracing::debug!("negotiation with {target} timed out after {timeout:?}");
            return Err(crate::Error::StreamAcquisitionTimeout);
        };
        let (stream_id, response, native) = negotiated?;

        let shared = conn.shared().clone();
        let duplex = match native {
            Some(stream) => DuplexStream::native(stream),
            None => split_duplex(shared, stream_id),
        };
        tracing::debug!(
            "duplex stream to {target} established, status {}",
            response.status()
        );
        let duplex = duplex
            .with_addrs(Some(conn.local_addr()), Some(conn.peer_addr()))
            .owning(conn);
        Ok((duplex, response))
    }

    fn lookup(&self, target: &TargetAddr) -> crate::Result<SocketAddr> {
        if let Some(addr) = self.config.resolve.get(target.host()) {
            return Ok(*addr);
        }
        (target.host(), target.port())
            .to_socket_addrs()
            .map_err(crate::Error::DialFailed)?
            .next()
            .ok_or_else(|| {
                crate::Error::DialFailed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{target} resolved to nothing"),
                ))
            })
    }

    async fn dial(&self, target: &TargetAddr, peer: SocketAddr) -> crate::Result<Connection> {
        let mut config = self.config.transport.quiche_config()?;
        self.config.trust.apply(&mut config)?;
        // no SNI for address literals
        let server_name = match target.host().parse::<IpAddr>() {
            Ok(_) => None,
            Err(_) => Some(target.host()),
        };
        let mut scid = [0; quiche::MAX_CONN_ID_LEN];
        rand::thread_rng().fill_bytes(&mut scid);
        Connection::connect(peer, server_name, &ConnectionId::from_ref(&scid), &mut config)
            .await
            .map_err(|e| crate::Error::DialFailed(e.into()))
    }
}

fn request_headers<T: NameValue>(
    url: &Url,
    target: &TargetAddr,
    strategy: Strategy,
    extra: &[T],
) -> Vec<Header> {
    let path = &url[Position::BeforePath..Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    let mut headers = vec![
        Header::new(b":method", b"POST"),
        Header::new(b":scheme", b"https"),
        Header::new(b":authority", target.to_string().as_bytes()),
        Header::new(b":path", path.as_bytes()),
        Header::new(MODE_HEADER, strategy.as_header()),
    ];
    // field names are lowercase on the wire
    headers.extend(
        extra
            .iter()
            .map(|h| Header::new(&h.name().to_ascii_lowercase(), h.value())),
    );
    headers
}

async fn verify_marker(stream: &QuicStream, stream_id: u64) -> crate::Result<()> {
    let mut marker = [0; MARKER_LEN];
    stream.read_exact(&mut marker).await?;
    if &marker[..4] != MARKER_TAG {
        return Err(crate::Error::Protocol("native stream without marker"));
    }
    let mut id = [0; 8];
    id.copy_from_slice(&marker[4..]);
    if u64::from_be_bytes(id) != stream_id {
        return Err(crate::Error::Protocol("native stream answers another request"));
    }
    Ok(())
}

fn split_duplex(shared: Rc<Shared>, stream_id: u64) -> DuplexStream {
    let reader = RecvBody::new(shared.clone(), stream_id);
    let writer = FlushingWriter::new(SendBody::new(shared, stream_id), CloseMode::Stream);
    DuplexStream::split(reader, writer)
}

static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

/// Dial with the process-wide default [`Client`].
///
/// The default trusts any server certificate ([`Trust::Insecure`]); build a
/// [`Client`] with another [`Trust`] for anything beyond development.
pub async fn connect(locator: &str, timeout: Duration) -> crate::Result<(DuplexStream, Response)> {
    DEFAULT_CLIENT
        .get_or_init(Client::default)
        .connect::<Header>(locator, &[], timeout)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_status() {
        let headers = vec![
            Header::new(b":status", b"204"),
            Header::new(b"server", b"h3"),
        ];
        let response = Response::from_headers(headers).unwrap();
        assert_eq!(response.status(), 204);
        assert!(response.is_success());
        assert_eq!(response.header(b"Server"), Some(&b"h3"[..]));
    }

    #[test]
    fn response_without_status_is_a_protocol_error() {
        let err = Response::from_headers(vec![Header::new(b"server", b"h3")]).unwrap_err();
        assert!(matches!(err, crate::Error::Protocol(_)));
        assert!(!Response::new(403, Vec::new()).is_success());
    }

    #[test]
    fn request_carries_mode_and_lowercased_headers() {
        let url = parse_locator("https://example.test:4433/tunnel?a=1").unwrap();
        let target = TargetAddr::from_url(&url).unwrap();
        let extra = [Header::new(b"X-Id", b"1")];
        let headers = request_headers(&url, &target, Strategy::Native, &extra);
        let find = |name: &[u8]| {
            headers
                .iter()
                .find(|h| h.name() == name)
                .map(|h| h.value().to_vec())
        };
        assert_eq!(find(b":method"), Some(b"POST".to_vec()));
        assert_eq!(find(b":path"), Some(b"/tunnel?a=1".to_vec()));
        assert_eq!(find(b":authority"), Some(b"example.test:4433".to_vec()));
        assert_eq!(find(MODE_HEADER), Some(b"native".to_vec()));
        assert_eq!(find(b"x-id"), Some(b"1".to_vec()));
    }

    #[test]
    fn resolve_override_skips_dns() {
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let client = Client::new(
            ClientConfig::default()
                .with_strategy(Strategy::Native)
                .resolve("Example.Test", addr),
        );
        assert_eq!(client.config().strategy, Strategy::Native);
        assert_eq!(client.config().trust, Trust::Insecure);
        let target = TargetAddr::parse("https://example.test:4433/").unwrap();
        assert_eq!(client.lookup(&target).unwrap(), addr);
    }

    #[monoio::test(timer_enabled = true)]
    async fn malformed_locator_fails_before_dialing() {
        let err = connect("https://exa mple.test:99999/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidAddress(_)));
    }
}
