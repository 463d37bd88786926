//! TLS configuration for both sides of the interception
//!
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring::default_provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ResolvesServerCert;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, ClientConfig, DigitallySignedStruct, Error as TLSError,
  ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// The only application protocol either side negotiates.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Client config for upstream connections. Upstream certificates are not verified.
pub fn client_config() -> crate::Result<ClientConfig> {
  let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
    .with_safe_default_protocol_versions()?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(config)
}

/// Connector built on [`client_config`].
pub fn connector() -> crate::Result<TlsConnector> {
  Ok(TlsConnector::from(Arc::new(client_config()?)))
}

/// Server config that delegates certificate selection to `resolver` and only offers HTTP/1.1.
pub fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> crate::Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(resolver);
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(config)
}

/// Acceptor for a config from [`server_config`].
pub fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
  TlsAcceptor::from(config)
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
