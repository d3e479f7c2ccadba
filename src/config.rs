use std::{path::PathBuf, time::Duration};

use crate::prelude::*;

/// QUIC parameters shared by both roles.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub idle_timeout: Duration,
    pub max_udp_payload_size: usize,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: MAX_DATAGRAM_SIZE,
            initial_max_data: 10_000_000,
            initial_max_stream_data: 1_000_000,
            initial_max_streams: 100,
        }
    }
}

impl TransportConfig {
    /// Build a quiche config advertising `h3` with these limits.
    pub(crate) fn quiche_config(&self) -> crate::Result<QuicheConfig> {
        let mut config = QuicheConfig::new(quiche::PROTOCOL_VERSION)?;
        config.set_application_protos(quiche::h3::APPLICATION_PROTOCOL)?;
        config.set_max_idle_timeout(self.idle_timeout.as_millis() as u64);
        config.set_max_recv_udp_payload_size(self.max_udp_payload_size);
        config.set_max_send_udp_payload_size(self.max_udp_payload_size);
        config.set_initial_max_data(self.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(self.initial_max_stream_data);
        config.set_initial_max_stream_data_bidi_remote(self.initial_max_stream_data);
        config.set_initial_max_stream_data_uni(self.initial_max_stream_data);
        // bidi streams are needed both ways: requests from the client, native
        // duplex streams from the server.
        config.set_initial_max_streams_bidi(self.initial_max_streams);
        config.set_initial_max_streams_uni(self.initial_max_streams);
        config.set_disable_active_migration(true);
        Ok(config)
    }
}

/// How a client checks the server certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Trust {
    /// Accept any certificate.
    ///
    /// This is the default so that self-signed development servers work out
    /// of the box. Pick [`Trust::System`] or [`Trust::CaFile`] in production.
    #[default]
    Insecure,
    /// Verify against the platform roots.
    System,
    /// Verify against the PEM bundle at this path.
    CaFile(PathBuf),
}

impl Trust {
    pub(crate) fn apply(&self, config: &mut QuicheConfig) -> crate::Result<()> {
        match self {
            Trust::Insecure => config.verify_peer(false),
            Trust::System => config.verify_peer(true),
            Trust::CaFile(path) => {
                config.verify_peer(true);
                config.load_verify_locations_from_file(&path.to_string_lossy())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PEM certificate chain.
    pub cert_chain: PathBuf,
    /// PEM private key.
    pub private_key: PathBuf,
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn new(cert_chain: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            cert_chain: cert_chain.into(),
            private_key: private_key.into(),
            transport: TransportConfig::default(),
        }
    }

    pub(crate) fn quiche_config(&self) -> crate::Result<QuicheConfig> {
        let mut config = self.transport.quiche_config()?;
        config.load_cert_chain_from_pem_file(&self.cert_chain.to_string_lossy())?;
        config.load_priv_key_from_pem_file(&self.private_key.to_string_lossy())?;
        config.verify_peer(false);
        Ok(config)
    }
}
