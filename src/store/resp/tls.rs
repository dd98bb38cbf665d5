use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::ConnectionError;
use crate::Result;

/// Builds a connector trusting only the configured CA, presenting the client
/// certificate when mutual TLS is configured.
pub(crate) fn connector(config: &TlsConfig) -> Result<TlsConnector> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(load_certs(&config.ca_file)?);
    if added == 0 {
        return Err(tls_error(format!("{} contains no usable CA certificate", config.ca_file)));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client_config = if config.mutual() {
        let certs = load_certs(&config.cert_file)?;
        let key = load_key(&config.key_file)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| tls_error(format!("invalid client certificate: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// TLS server name of `host:port`
pub(crate) fn server_name(endpoint: &str) -> Result<ServerName<'static>> {
    let host = endpoint
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(endpoint)
        .trim_start_matches('[')
        .trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| tls_error(format!("invalid server name {host:?}: {e}")))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse {path}: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error(format!("{path} contains no certificates")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(format!("failed to parse {path}: {e}")))?
        .ok_or_else(|| tls_error(format!("{path} contains no private key")))
}

fn open(path: &str) -> Result<File> {
    File::open(path).map_err(|e| tls_error(format!("failed to open {path}: {e}")))
}

fn tls_error(message: String) -> crate::Error {
    ConnectionError::Tls(message).into()
}
