//! Shared fixtures: a throwaway root CA, local upstreams and a running proxy.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
  PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls::pki_types::PrivatePkcs8KeyDer;
use wiretap::config::ListenerConfig;
use wiretap::forward::Forwarder;
use wiretap::server::ProxyServer;
use wiretap::storage::MemoryRepository;
use wiretap::{read_request, CertificateAuthority, Request, Response, ResponseBuilder, ResponseConfig};

/// A self-signed RSA root as `(cert_pem, key_pem)`.
pub fn root_pem() -> (String, String) {
  let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
  let key_pem = rsa_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
  let der = PrivatePkcs8KeyDer::from(rsa_key.to_pkcs8_der().unwrap().as_bytes().to_vec());
  let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&der, &PKCS_RSA_SHA256).unwrap();
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Wiretap Integration Root");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
  let cert = params.self_signed(&key_pair).unwrap();
  (cert.pem(), key_pem)
}

/// Root material written to a fresh temp directory, as `(cert_path, key_path)`.
pub fn root_files(name: &str) -> (PathBuf, PathBuf) {
  let dir = std::env::temp_dir().join(format!("wiretap-{}-{}", name, std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  std::fs::create_dir_all(&dir).unwrap();
  let (cert_pem, key_pem) = root_pem();
  let cert_path = dir.join("ca.crt");
  let key_path = dir.join("ca.key");
  std::fs::write(&cert_path, cert_pem).unwrap();
  std::fs::write(&key_path, key_pem).unwrap();
  (cert_path, key_path)
}

pub fn authority() -> Arc<CertificateAuthority> {
  let (cert_pem, key_pem) = root_pem();
  Arc::new(CertificateAuthority::from_pem(&cert_pem, &key_pem, "Wiretap").unwrap())
}

/// `200 OK` with a `Content-Length` framed body.
pub fn ok(body: &str) -> Response {
  Response::builder()
    .status(200)
    .header("content-length", body.len())
    .body(body.to_string())
    .unwrap()
    .into()
}

async fn answer<S, F>(stream: S, handler: Arc<F>)
where
  S: AsyncRead + AsyncWrite + Unpin,
  F: Fn(Request) -> Response,
{
  let mut reader = BufReader::new(stream);
  if let Ok(Some(request)) = read_request(&mut reader).await {
    let response = handler(request);
    let _ = reader.write_all(&response.to_raw()).await;
    let _ = reader.shutdown().await;
  }
}

/// Plain HTTP upstream answering every connection with `handler`.
pub async fn spawn_upstream<F>(handler: F) -> SocketAddr
where
  F: Fn(Request) -> Response + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(answer(stream, handler.clone()));
    }
  });
  addr
}

/// HTTPS upstream presenting a leaf for `localhost` from `ca`.
pub async fn spawn_tls_upstream<F>(ca: &CertificateAuthority, handler: F) -> SocketAddr
where
  F: Fn(Request) -> Response + Send + Sync + 'static,
{
  let issued = ca.issue_leaf("localhost").unwrap();
  let config = tokio_rustls::rustls::ServerConfig::builder_with_provider(Arc::new(
    tokio_rustls::rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_no_client_auth()
  .with_single_cert(issued.chain, issued.key)
  .unwrap();
  let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let handler = handler.clone();
      tokio::spawn(async move {
        if let Ok(stream) = acceptor.accept(stream).await {
          answer(stream, handler).await;
        }
      });
    }
  });
  addr
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap()
}

pub struct RunningProxy {
  pub addr: SocketAddr,
  pub repository: Arc<MemoryRepository>,
  stop: Option<oneshot::Sender<()>>,
}

impl Drop for RunningProxy {
  fn drop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
  }
}

/// A proxy on an ephemeral port, capturing into a fresh repository.
pub async fn spawn_proxy(ca: Arc<CertificateAuthority>) -> RunningProxy {
  let repository = Arc::new(MemoryRepository::new());
  let forwarder = Forwarder::capturing(
    repository.clone(),
    Duration::from_secs(5),
    Duration::from_secs(2),
  )
  .unwrap();
  let server = ProxyServer::new(ca, forwarder, ListenerConfig::proxy())
    .graceful_shutdown_timeout(Duration::from_millis(200));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (stop, stopped) = oneshot::channel::<()>();
  tokio::spawn(async move {
    server
      .serve(listener, async {
        let _ = stopped.await;
      })
      .await
  });
  RunningProxy {
    addr,
    repository,
    stop: Some(stop),
  }
}

/// Write `raw`, then read until the peer closes.
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> String {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(raw).await.unwrap();
  let mut answer = Vec::new();
  stream.read_to_end(&mut answer).await.unwrap();
  String::from_utf8_lossy(&answer).into_owned()
}

/// `GET path` against a server and parse the reply.
pub async fn get(addr: SocketAddr, path: &str) -> Response {
  let raw = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, addr);
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(raw.as_bytes()).await.unwrap();
  ResponseBuilder::new(BufReader::new(stream), ResponseConfig::new(&Request::default()))
    .build()
    .await
    .unwrap()
}
