use std::sync::Arc;

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate,
    ClientConfig,
    Error as TlsError,
    OwnedTrustAnchor,
    RootCertStore,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::{
    client::options::TlsOptions,
    error::{Error, Result},
};

/// Configuration required to use TLS. Creating this is expensive, so it is cached and reused
/// for multiple connections.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options.
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let mut config = make_rustls_config(options)?;
        config.enable_sni = true;
        let connector: TlsConnector = Arc::new(config).into();
        Ok(TlsConfig { connector })
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host).map_err(|e| {
            Error::invalid_argument(format!("invalid TLS host name {:?}: {}", host, e))
        })?;
        Ok(self.connector.connect(name, tcp_stream).await?)
    }
}

fn make_rustls_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|anchor| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let mut config = config;
    if options.allow_invalid_certificates == Some(true) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    Ok(config)
}

/// Certificate verifier that accepts anything; installed only when the user explicitly opts out
/// of certificate validation.
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
