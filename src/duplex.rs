use std::{
    cell::Cell,
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use futures::lock::Mutex;

use crate::{Connection, FlushingWriter, QuicStream, RecvBody};

/// Returned by the address accessors when no address was captured.
pub const UNKNOWN_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// How the two directions of a [`DuplexStream`] are carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Request body one way, response body the other.
    #[default]
    Split,
    /// A separate bidirectional stream the server opens next to the
    /// negotiation request.
    Native,
}

impl Strategy {
    pub(crate) fn as_header(&self) -> &'static [u8] {
        match self {
            Strategy::Split => b"split",
            Strategy::Native => b"native",
        }
    }

    pub(crate) fn from_header(value: &[u8]) -> Option<Self> {
        match value {
            b"split" => Some(Strategy::Split),
            b"native" => Some(Strategy::Native),
            _ => None,
        }
    }
}

enum Halves {
    // reads and writes are serialized among themselves, not against each other
    Split {
        reader: RecvBody,
        writer: FlushingWriter,
        read_lock: Mutex<()>,
        write_lock: Mutex<()>,
    },
    Native(QuicStream),
}

/// A symmetric, ordered byte stream to the peer.
pub struct DuplexStream {
    halves: Halves,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    closed: Cell<bool>,
    // keeps a dialed connection's driver alive
    _conn: Option<Connection>,
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl DuplexStream {
    pub(crate) fn split(reader: RecvBody, writer: FlushingWriter) -> Self {
        Self::with_halves(Halves::Split {
            reader,
            writer,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn native(stream: QuicStream) -> Self {
        Self::with_halves(Halves::Native(stream))
    }

    fn with_halves(halves: Halves) -> Self {
        Self {
            halves,
            local: None,
            peer: None,
            closed: Cell::new(false),
            _conn: None,
        }
    }

    pub(crate) fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local = local;
        self.peer = peer;
        self
    }

    pub(crate) fn owning(mut self, conn: Connection) -> Self {
        self._conn = Some(conn);
        self
    }

    pub fn strategy(&self) -> Strategy {
        match self.halves {
            Halves::Split { .. } => Strategy::Split,
            Halves::Native(_) => Strategy::Native,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.unwrap_or(UNKNOWN_ADDR)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.unwrap_or(UNKNOWN_ADDR)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Read into `buf`; `Ok(0)` means the peer finished sending.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let res = match &self.halves {
            Halves::Split {
                reader, read_lock, ..
            } => {
                let _guard = read_lock.lock().await;
                reader.read(buf).await
            }
            Halves::Native(stream) => stream.read(buf).await,
        };
        self.check(res)
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

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let res = match &self.halves {
            Halves::Split {
                writer, write_lock, ..
            } => {
                let _guard = write_lock.lock().await;
                writer.write(buf).await
            }
            Halves::Native(stream) => stream.write(buf).await,
        };
        self.check(res)
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Close both directions.
    ///
    /// Both sides are always attempted; if both fail the write side's error
    /// is returned. Calling it again is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        match &self.halves {
            Halves::Split { reader, writer, .. } => {
                let read = reader.close().await;
                let write = writer.close().await;
                write.and(read)
            }
            Halves::Native(stream) => stream.close().await,
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.get() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "duplex stream is closed",
            ));
        }
        Ok(())
    }

    // a terminal error on either side takes the whole stream down
    fn check<T>(&self, res: io::Result<T>) -> io::Result<T> {
        if res.is_err() && !self.closed.replace(true) {
            match &self.halves {
                Halves::Split { reader, writer, .. } => {
                    reader.shutdown();
                    writer.shutdown();
                }
                Halves::Native(stream) => stream.shutdown(),
            }
        }
        res
    }
}
