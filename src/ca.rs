//! Certificate Authority for on-the-fly leaf issuance
//!
//! The root key and certificate are loaded once. Every leaf shares one
//! proxy-held RSA key, so only the signature differs between handshakes.
//!

use crate::errors::{Error, Result};
use rand::RngCore;
use rcgen::{
  DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair,
  KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{CertifiedKey, SigningKey};
use tokio_rustls::rustls::ServerConfig;

/// Half-width of the leaf validity window around the issuance instant.
pub const LEAF_VALIDITY: Duration = Duration::hours(1);
/// Size of the proxy identity key.
const PROXY_KEY_BITS: usize = 2048;

/// A leaf certificate minted for one handshake.
pub struct IssuedCertificate {
  /// `[leaf, root]`, DER encoded
  pub chain: Vec<CertificateDer<'static>>,
  /// The proxy identity key the leaf certifies
  pub key: PrivateKeyDer<'static>,
  /// Subject CN: the hostname with any port stripped
  pub common_name: String,
  /// Issuance instant minus [`LEAF_VALIDITY`]
  pub not_before: OffsetDateTime,
  /// Issuance instant plus [`LEAF_VALIDITY`]
  pub not_after: OffsetDateTime,
}

/// Issues leaf certificates signed by a root loaded from disk.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  proxy_key: KeyPair,
  proxy_key_der: PrivatePkcs8KeyDer<'static>,
  signing_key: Arc<dyn SigningKey>,
  key_id: Vec<u8>,
  organization: String,
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("organization", &self.organization)
      .field("key_id", &self.key_id)
      .finish_non_exhaustive()
  }
}

impl CertificateAuthority {
  /// Load the root certificate and RSA key from PEM files.
  pub async fn new(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    organization: impl Into<String>,
  ) -> Result<Self> {
    let cert_pem = tokio::fs::read_to_string(cert_path.as_ref()).await.map_err(|e| {
      Error::certificate_error(format!(
        "failed to read CA certificate {}: {}",
        cert_path.as_ref().display(),
        e
      ))
    })?;
    let key_pem = tokio::fs::read_to_string(key_path.as_ref()).await.map_err(|e| {
      Error::certificate_error(format!(
        "failed to read CA key {}: {}",
        key_path.as_ref().display(),
        e
      ))
    })?;
    Self::from_pem(&cert_pem, &key_pem, organization)
  }

  /// Build from PEM text. Fails if the key is not RSA or the certificate does not parse.
  pub fn from_pem(cert_pem: &str, key_pem: &str, organization: impl Into<String>) -> Result<Self> {
    let root_key = rsa_key_from_pem(key_pem)?;
    let root_key = KeyPair::from_pkcs8_der_and_sign_algo(&root_key, &PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_error(format!("failed to load CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, root_key)
      .map_err(|e| Error::certificate_error(format!("failed to parse CA certificate: {}", e)))?;
    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate_error(format!("failed to parse CA PEM: {}", e)))?;

    let proxy_rsa = RsaPrivateKey::new(&mut rand::thread_rng(), PROXY_KEY_BITS)
      .map_err(|e| Error::certificate_error(format!("failed to generate proxy key: {}", e)))?;
    let public_der = proxy_rsa
      .to_public_key()
      .to_public_key_der()
      .map_err(|e| Error::certificate_error(format!("failed to encode proxy public key: {}", e)))?;
    let key_id = Sha1::digest(public_der.as_bytes()).to_vec();
    let proxy_key_der = PrivatePkcs8KeyDer::from(
      proxy_rsa
        .to_pkcs8_der()
        .map_err(|e| Error::certificate_error(format!("failed to encode proxy key: {}", e)))?
        .as_bytes()
        .to_vec(),
    );
    let proxy_key = KeyPair::from_pkcs8_der_and_sign_algo(&proxy_key_der, &PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_error(format!("failed to load proxy key: {}", e)))?;
    let signing_key = any_supported_type(&PrivateKeyDer::Pkcs8(proxy_key_der.clone_key()))?;

    Ok(Self {
      issuer,
      root_der,
      proxy_key,
      proxy_key_der,
      signing_key,
      key_id,
      organization: organization.into(),
    })
  }

  /// Root certificate in DER form.
  pub fn root_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }

  /// SHA-1 of the proxy public key, carried as every leaf's subject key id.
  pub fn key_id(&self) -> &[u8] {
    &self.key_id
  }

  /// Mint a leaf for `hostname`. Any port suffix is dropped first.
  pub fn issue_leaf(&self, hostname: &str) -> Result<IssuedCertificate> {
    let host = strip_port(hostname);
    if host.is_empty() {
      return Err(Error::certificate_error(format!(
        "invalid hostname: {:?}",
        hostname
      )));
    }
    let mut params = rcgen::CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::thread_rng()
      .try_fill_bytes(&mut serial)
      .map_err(|e| Error::certificate_error(format!("failed to generate serial number: {}", e)))?;
    // keep the DER integer positive
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, self.organization.as_str());
    params.distinguished_name = dn;

    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid domain name: {}", host))
      })?)],
    };

    let now = OffsetDateTime::now_utc();
    let (not_before, not_after) = (now - LEAF_VALIDITY, now + LEAF_VALIDITY);
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_identifier_method = KeyIdMethod::PreSpecified(self.key_id.clone());

    let cert = params
      .signed_by(&self.proxy_key, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf for {}: {}", host, e)))?;

    Ok(IssuedCertificate {
      chain: vec![cert.der().clone(), self.root_der.clone()],
      key: PrivateKeyDer::Pkcs8(self.proxy_key_der.clone_key()),
      common_name: host.to_string(),
      not_before,
      not_after,
    })
  }

  /// A freshly issued leaf in the form rustls serves.
  pub fn certified_key(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
    let issued = self.issue_leaf(hostname)?;
    Ok(Arc::new(CertifiedKey::new(
      issued.chain,
      self.signing_key.clone(),
    )))
  }

  /// Server TLS config that issues a leaf on every handshake, keyed by SNI and
  /// falling back to `default_host`.
  pub fn server_config(self: &Arc<Self>, default_host: &str) -> Result<Arc<ServerConfig>> {
    let resolver = LeafResolver {
      ca: self.clone(),
      default_host: default_host.to_string(),
    };
    Ok(Arc::new(crate::tls::server_config(Arc::new(resolver))?))
  }
}

/// Per-handshake certificate selection. Holds no cache.
struct LeafResolver {
  ca: Arc<CertificateAuthority>,
  default_host: String,
}

impl fmt::Debug for LeafResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafResolver")
      .field("default_host", &self.default_host)
      .finish()
  }
}

impl ResolvesServerCert for LeafResolver {
  fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    let host = client_hello.server_name().unwrap_or(&self.default_host);
    match self.ca.certified_key(host) {
      Ok(key) => Some(key),
      Err(err) => {
        tracing::warn!(host, error = %err, "[MITM] leaf issuance failed");
        None
      }
    }
  }
}

fn rsa_key_from_pem(key_pem: &str) -> Result<PrivatePkcs8KeyDer<'static>> {
  let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
    .map_err(|e| Error::certificate_error(format!("failed to parse CA key PEM: {}", e)))?
    .ok_or_else(|| Error::certificate_error("no private key found in CA key PEM"))?;
  let rsa_key = match &key {
    PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der()).ok(),
    PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()).ok(),
    _ => None,
  }
  .ok_or_else(|| Error::certificate_error("CA private key is not an RSA key"))?;
  let der = rsa_key
    .to_pkcs8_der()
    .map_err(|e| Error::certificate_error(format!("failed to encode CA key: {}", e)))?;
  Ok(PrivatePkcs8KeyDer::from(der.as_bytes().to_vec()))
}

/// `example.com:443` -> `example.com`, `[::1]:443` -> `::1`. Bare IPv6 literals are kept.
pub fn strip_port(hostname: &str) -> &str {
  if let Some(rest) = hostname.strip_prefix('[') {
    return rest.split(']').next().unwrap_or(rest);
  }
  if hostname.parse::<IpAddr>().is_ok() {
    return hostname;
  }
  match hostname.rsplit_once(':') {
    Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
    _ => hostname,
  }
}
