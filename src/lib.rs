//! Full-duplex byte streams over HTTP/3.
//!
//! A client [`connect`]s to an HTTP/3 endpoint with a single negotiation
//! request; the server handler hands the inbound [`Exchange`] to [`accept`].
//! Both sides end up with a [`DuplexStream`] that reads and writes raw bytes
//! in order, like a socket.

pub mod addr;
pub mod client;
mod config;
mod connection;
mod duplex;
mod endpoint;
mod error;
mod flush;
mod h3;
mod macros;
mod rendezvous;
pub mod server;
mod session;
mod stream;

pub use addr::{normalize, TargetAddr};
pub use client::{connect, Client, ClientConfig, Response};
pub use config::{ServerConfig, TransportConfig, Trust};
pub use connection::Connection;
pub use duplex::{DuplexStream, Strategy, UNKNOWN_ADDR};
pub use endpoint::Listener;
pub use error::{Error, Result};
pub use flush::{CloseMode, FlushingWriter};
pub use server::{accept, Exchange, Upgrader, Version};
pub use stream::{QuicStream, RecvBody, SendBody};
// re-export quiche
pub use quiche;
pub use quiche::h3::Header;

mod prelude {
    pub(crate) use quiche::{
        h3::{Config as QuicheH3Config, Connection as QuicheH3Connection},
        Config as QuicheConfig, Connection as QuicheConnection,
    };
    pub(crate) const MAX_DATAGRAM_SIZE: usize = 1350;
    /// Request header carrying the negotiated [`Strategy`](crate::Strategy).
    pub(crate) const MODE_HEADER: &[u8] = b"duplex-mode";
    /// Tag written first on a natively opened stream, followed by the
    /// big-endian id of the request stream it answers.
    pub(crate) const MARKER_TAG: &[u8; 4] = b"H3DX";
    pub(crate) const MARKER_LEN: usize = 12;
    /// H3_NO_ERROR.
    pub(crate) const H3_NO_ERROR: u64 = 0x100;
}
