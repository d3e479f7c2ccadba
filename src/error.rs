use std::io;

use thiserror::Error;

use crate::client::Response;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("quiche error: {0}")]
    Quiche(#[from] quiche::Error),
    #[error("quiche h3 error: {0}")]
    QuicheH3(#[from] quiche::h3::Error),

    /// The locator could not be turned into a dialable address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The QUIC connection to the peer could not be established.
    #[error("dial failed: {0}")]
    DialFailed(#[source] io::Error),
    /// The peer answered the negotiation with a non-success status.
    #[error("handshake rejected with status {status}")]
    HandshakeRejected { status: u16, response: Response },
    /// The deadline expired before the duplex primitive was obtained.
    #[error("timed out before the duplex stream was acquired")]
    StreamAcquisitionTimeout,
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(&'static str),
    #[error("local address unavailable")]
    AddressUnavailable,
    #[error("failed to open stream: {0}")]
    StreamOpenFailed(#[source] quiche::Error),
    /// The peer did something the negotiation does not allow.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::DialFailed(e) => e,
            Error::Quiche(e) => io::Error::new(io::ErrorKind::Other, e),
            Error::QuicheH3(e) => io::Error::new(io::ErrorKind::Other, e),
            e @ Error::InvalidAddress(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
            e @ Error::HandshakeRejected { .. } => {
                io::Error::new(io::ErrorKind::ConnectionRefused, e)
            }
            e @ Error::StreamAcquisitionTimeout => io::Error::new(io::ErrorKind::TimedOut, e),
            e @ Error::UnsupportedProtocol(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            e @ Error::AddressUnavailable => io::Error::new(io::ErrorKind::AddrNotAvailable, e),
            e @ (Error::StreamOpenFailed(_) | Error::Protocol(_)) => {
                io::Error::new(io::ErrorKind::Other, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_kind() {
        let err: io::Error = Error::StreamAcquisitionTimeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = Error::InvalidAddress("nope".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let inner = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: io::Error = Error::DialFailed(inner).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn rejected_status_is_displayed() {
        let response = Response::new(404, Vec::new());
        let err = Error::HandshakeRejected {
            status: 404,
            response,
        };
        assert_eq!(err.to_string(), "handshake rejected with status 404");
    }
}
