//! TLS negotiation.
//!
//! 1. The server's handshake advertises `CLIENT_SSL`.
//! 2. The client sends a short SSL request (capabilities, max packet size,
//!    charset, 23 reserved bytes) with sequence number 1.
//! 3. The TLS handshake runs over the raw socket.
//! 4. The handshake response and the rest of the session go over TLS, with
//!    the sequence continuing at 2.
//!
//! The rustls pieces are behind the `tls` feature. Without it, modes that
//! require TLS fail and `Preferred` stays on plaintext.

use asyncmy_core::Error;
use asyncmy_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};

#[cfg(feature = "tls")]
use std::sync::Arc;

/// SSL request payload (32 bytes).
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.into_bytes()
}

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given the mode and what the server offers.
pub fn should_upgrade(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let supported = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred if !cfg!(feature = "tls") => {
            tracing::warn!("ssl-mode PREFERRED without the `tls` feature; using plaintext");
            Ok(false)
        }
        SslMode::Preferred => {
            if !supported {
                tracing::warn!("server does not offer TLS; continuing in plaintext");
            }
            Ok(supported)
        }
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !cfg!(feature = "tls") {
                Err(tls_error(
                    "TLS required but asyncmy was built without the `tls` feature",
                ))
            } else if supported {
                Ok(true)
            } else {
                Err(tls_error("TLS required but the server does not support it"))
            }
        }
    }
}

/// Check that the certificate settings make sense for the mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if ssl_mode == SslMode::VerifyIdentity && tls_config.danger_skip_verify {
        return Err(tls_error(
            "VERIFY_IDENTITY cannot be combined with skipping certificate verification",
        ));
    }
    Ok(())
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

#[cfg(feature = "tls")]
pub(crate) fn server_name(
    host: &str,
    tls_config: &TlsConfig,
) -> Result<rustls::pki_types::ServerName<'static>, Error> {
    let name = tls_config.server_name.as_deref().unwrap_or(host);
    name.to_string()
        .try_into()
        .map_err(|e| tls_error(format!("invalid TLS server name '{name}': {e}")))
}

/// Build the rustls client config for a mode.
///
/// - `Preferred` / `Required`: encrypt without verifying the certificate
/// - `VerifyCa` / `VerifyIdentity`: verify against the configured CA bundle,
///   or the webpki roots when none is configured
#[cfg(feature = "tls")]
pub(crate) fn build_client_config(
    ssl_mode: SslMode,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    match ssl_mode {
        SslMode::Disable => Err(tls_error("TLS config requested with SslMode::Disable")),
        SslMode::Preferred | SslMode::Required => build_no_verify_config(&provider, tls_config),
        SslMode::VerifyCa | SslMode::VerifyIdentity if tls_config.danger_skip_verify => {
            build_no_verify_config(&provider, tls_config)
        }
        SslMode::VerifyCa | SslMode::VerifyIdentity => build_verified_config(&provider, tls_config),
    }
}

#[cfg(feature = "tls")]
fn versioned_builder(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ConfigBuilder<rustls::ClientConfig, rustls::WantsVerifier>, Error> {
    rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))
}

#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let builder = versioned_builder(provider)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier));
    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn build_verified_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::RootCertStore;

    let mut root_store = RootCertStore::empty();
    match &tls_config.ca_cert_path {
        Some(path) => {
            let certs = load_certs(path)?;
            for cert in certs {
                root_store
                    .add(cert)
                    .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = versioned_builder(provider)?.with_root_certificates(root_store);
    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path)?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", key_path.display())))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client certificate: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;

    #[test]
    fn test_build_ssl_request() {
        let payload = build_ssl_request(
            capabilities::DEFAULT_CLIENT_FLAGS,
            16 * 1024 * 1024,
            charset::UTF8MB4_GENERAL_CI,
        );
        assert_eq!(payload.len(), 32);
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::CLIENT_SSL != 0);
        assert_eq!(payload[8], charset::UTF8MB4_GENERAL_CI);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_should_upgrade() {
        assert!(!should_upgrade(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
        assert!(!should_upgrade(SslMode::Preferred, 0).unwrap());
        assert!(should_upgrade(SslMode::Required, 0).is_err());
        assert!(should_upgrade(SslMode::VerifyIdentity, 0).is_err());
        assert_eq!(
            should_upgrade(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap(),
            cfg!(feature = "tls")
        );
        assert_eq!(
            should_upgrade(SslMode::Required, capabilities::CLIENT_SSL).is_ok(),
            cfg!(feature = "tls")
        );
    }

    #[test]
    fn test_required_error_kind() {
        match should_upgrade(SslMode::Required, 0) {
            Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Ssl),
            other => panic!("expected Ssl error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_tls_config() {
        let config = TlsConfig::new();
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());

        let half = TlsConfig::new().client_cert("/tmp/client.pem");
        assert!(validate_tls_config(SslMode::Required, &half).is_err());

        let both = half.client_key("/tmp/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &both).is_ok());

        let skip = TlsConfig::new().skip_verify(true);
        assert!(validate_tls_config(SslMode::VerifyCa, &skip).is_ok());
        assert!(validate_tls_config(SslMode::VerifyIdentity, &skip).is_err());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_client_config_modes() {
        let config = TlsConfig::new();
        assert!(build_client_config(SslMode::Disable, &config).is_err());
        assert!(build_client_config(SslMode::Required, &config).is_ok());
        assert!(build_client_config(SslMode::VerifyCa, &config).is_ok());
        let missing_ca = TlsConfig::new().ca_cert("/nonexistent/ca.pem");
        assert!(build_client_config(SslMode::VerifyCa, &missing_ca).is_err());
        assert!(server_name("db.example.com", &config).is_ok());
        assert!(server_name("127.0.0.1", &config).is_ok());
    }
}
