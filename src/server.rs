//! The proxy listener.
//!
//! A connection is read by the listener only up to the end of its first
//! request. After that it is hijacked: ownership moves into a [`Hijacked`]
//! stream, and the handler alone answers and closes it.
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Version};
use socket2::SockRef;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::ca::CertificateAuthority;
use crate::config::ListenerConfig;
use crate::errors::{Error, Result};
use crate::forward::{change_request_to_target, Forwarder, Scheme};
use crate::request::read_request;
use crate::Request;

/// Written to the client once a CONNECT has been accepted.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// A bare status line with an empty header block, e.g. `HTTP/1.1 502 Bad Gateway`.
pub fn status_line(version: Version, status: StatusCode) -> Bytes {
  Bytes::from(format!("{:?} {}\r\n\r\n", version, status))
}

/// A connection taken out of the listener's hands.
///
/// Bytes the listener had already buffered past the request head (an eager
/// TLS ClientHello, say) are read first.
#[derive(Debug)]
pub struct Hijacked {
  inner: BufReader<TcpStream>,
}

impl Hijacked {
  /// One-way handoff. On failure the client gets a best-effort 500 and the
  /// connection is closed.
  pub async fn take(mut reader: BufReader<TcpStream>) -> Result<Self> {
    if let Err(err) = configure(reader.get_ref()) {
      let _ = reader
        .get_mut()
        .write_all(&status_line(Version::HTTP_11, StatusCode::INTERNAL_SERVER_ERROR))
        .await;
      let _ = reader.get_mut().shutdown().await;
      return Err(err);
    }
    Ok(Hijacked { inner: reader })
  }
}

fn configure(stream: &TcpStream) -> Result<()> {
  let socket = SockRef::from(stream);
  socket.set_nodelay(true)?;
  socket.set_keepalive(true)?;
  Ok(())
}

impl AsyncRead for Hijacked {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Hijacked {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// How reading the tunneled request ended.
#[derive(Debug)]
pub enum ReadOutcome {
  /// A complete request
  Request(Request),
  /// The peer closed before sending anything
  Closed,
  /// The peer reset or aborted the connection
  Reset(Error),
  /// The read deadline passed
  Timeout,
  /// TLS or socket failure
  Transport(Error),
  /// Bytes arrived but were not an HTTP/1.x request
  Malformed(Error),
}

/// Sorts the result of a tunneled request read into a [`ReadOutcome`].
pub fn classify(result: Result<Option<Request>>) -> ReadOutcome {
  match result {
    Ok(Some(request)) => ReadOutcome::Request(request),
    Ok(None) => ReadOutcome::Closed,
    Err(Error::IO(err)) => match err.kind() {
      io::ErrorKind::UnexpectedEof => ReadOutcome::Closed,
      io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::BrokenPipe => ReadOutcome::Reset(Error::IO(err)),
      io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ReadOutcome::Timeout,
      _ => ReadOutcome::Transport(Error::IO(err)),
    },
    Err(Error::Timeout(_)) => ReadOutcome::Timeout,
    Err(err @ Error::Tls(_)) => ReadOutcome::Transport(err),
    Err(err) => ReadOutcome::Malformed(err),
  }
}

/// Intercepting proxy listener.
#[derive(Debug, Clone)]
pub struct ProxyServer {
  ca: Arc<CertificateAuthority>,
  forwarder: Forwarder,
  config: ListenerConfig,
  graceful_shutdown_timeout: Duration,
}

impl ProxyServer {
  /// Server issuing leaves from `ca` and forwarding through `forwarder`.
  pub fn new(ca: Arc<CertificateAuthority>, forwarder: Forwarder, config: ListenerConfig) -> Self {
    ProxyServer {
      ca,
      forwarder,
      config,
      graceful_shutdown_timeout: Duration::from_secs(10),
    }
  }
  /// How long in-flight connections get once `shutdown` resolves.
  pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.graceful_shutdown_timeout = timeout;
    self
  }

  /// Accept connections until `shutdown` resolves.
  pub async fn serve<S>(&self, listener: TcpListener, shutdown: S) -> Result<()>
  where
    S: Future<Output = ()>,
  {
    tracing::info!(address = %listener.local_addr()?, "[MITM] proxy listening");
    let server = self.clone();
    accept_loop(
      listener,
      shutdown,
      self.graceful_shutdown_timeout,
      move |stream, peer| {
        let server = server.clone();
        async move { server.handle(stream, peer).await }
      },
    )
    .await
  }

  /// Serve one client connection to completion.
  pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
    let conn = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let mut reader = BufReader::new(stream);
    let request = match read_head(&mut reader, &self.config).await {
      Some(request) => request,
      None => return,
    };
    let scheme = if request.method() == Method::CONNECT {
      Scheme::Https
    } else {
      Scheme::Http
    };
    let span = tracing::info_span!("conn", conn, %peer, %scheme);
    async move {
      tracing::debug!(method = %request.method(), uri = %request.uri(), "accepted");
      let hijacked = match Hijacked::take(reader).await {
        Ok(hijacked) => hijacked,
        Err(err) => {
          tracing::error!(error = %err, "[MITM] hijack failed");
          return;
        }
      };
      match scheme {
        Scheme::Http => self.handle_plain(hijacked, request).await,
        Scheme::Https => self.handle_tunnel(hijacked, request).await,
      }
    }
    .instrument(span)
    .await
  }

  async fn handle_plain(&self, mut conn: Hijacked, request: Request) {
    let payload = match self.forwarder.forward(&request, Scheme::Http).await {
      Ok(dump) => dump,
      Err(err) => {
        tracing::error!(error = %err, "[MITM] forwarding failed");
        status_line(request.version(), StatusCode::BAD_GATEWAY)
      }
    };
    if let Err(err) = write_within(&mut conn, &payload, self.config.write_timeout).await {
      tracing::warn!(error = %err, "failed to write response");
    }
    let _ = conn.shutdown().await;
  }

  async fn handle_tunnel(&self, mut conn: Hijacked, connect: Request) {
    let authority = match connect
      .uri()
      .authority()
      .map(|a| a.to_string())
      .or_else(|| connect.host())
    {
      Some(authority) => authority,
      None => {
        tracing::warn!("CONNECT without a target");
        let _ = conn
          .write_all(&status_line(connect.version(), StatusCode::BAD_REQUEST))
          .await;
        let _ = conn.shutdown().await;
        return;
      }
    };
    if let Err(err) = write_within(&mut conn, TUNNEL_ESTABLISHED, self.config.write_timeout).await {
      tracing::warn!(error = %err, "failed to confirm tunnel");
      return;
    }

    let tls_config = match self.ca.server_config(&authority) {
      Ok(config) => config,
      Err(err) => {
        tracing::error!(error = %err, "[MITM] no server config");
        let _ = conn.shutdown().await;
        return;
      }
    };
    let accept = crate::tls::acceptor(tls_config).accept(conn);
    let tls = match tokio::time::timeout(self.config.read_timeout, accept).await {
      Ok(Ok(tls)) => tls,
      Ok(Err(err)) => {
        tracing::warn!(host = %authority, error = %err, "[MITM] tls handshake failed");
        return;
      }
      Err(_) => {
        tracing::warn!(host = %authority, "[MITM] tls handshake timed out");
        return;
      }
    };

    let mut tls = BufReader::new(tls);
    let read = tokio::time::timeout(self.config.read_timeout, read_request(&mut tls))
      .await
      .unwrap_or(Err(Error::Timeout(self.config.read_timeout)));
    let request = match classify(read) {
      ReadOutcome::Request(request) => Some(request),
      ReadOutcome::Closed => {
        tracing::info!("client closed the tunnel");
        None
      }
      ReadOutcome::Reset(err) => {
        tracing::error!(error = %err, "connection reset by client");
        None
      }
      ReadOutcome::Timeout => {
        tracing::warn!("timed out reading tunneled request");
        None
      }
      ReadOutcome::Transport(err) => {
        tracing::error!(error = %err, "transport error");
        None
      }
      ReadOutcome::Malformed(err) => {
        tracing::error!(error = %err, "error reading tunneled request");
        None
      }
    };
    let Some(mut request) = request else {
      let _ = tls.shutdown().await;
      return;
    };

    let forwarded = match change_request_to_target(&mut request, &authority, Scheme::Https) {
      Ok(()) => self.forwarder.forward(&request, Scheme::Https).await,
      Err(err) => Err(Error::forward(err)),
    };
    match forwarded {
      Ok(dump) => {
        if let Err(err) = write_within(&mut tls, &dump, self.config.write_timeout).await {
          tracing::warn!(error = %err, "failed to write response");
        }
        let _ = tls.shutdown().await;
      }
      Err(err) => {
        tracing::error!(host = %authority, error = %err, "[MITM] forwarding failed");
        // straight onto the socket, under the TLS layer
        let (raw, _) = tls.get_mut().get_mut();
        let _ = raw
          .write_all(&status_line(connect.version(), StatusCode::BAD_GATEWAY))
          .await;
        let _ = raw.shutdown().await;
      }
    }
  }
}

/// Reads the first request off a fresh connection, answering 400 when it is
/// not HTTP/1.x. `None` means there is nothing left to do.
pub(crate) async fn read_head(
  reader: &mut BufReader<TcpStream>,
  config: &ListenerConfig,
) -> Option<Request> {
  match tokio::time::timeout(config.idle_timeout, reader.fill_buf()).await {
    Ok(Ok(buf)) if !buf.is_empty() => {}
    Ok(Ok(_)) => return None,
    Ok(Err(err)) => {
      tracing::debug!(error = %err, "read failed before request");
      return None;
    }
    Err(_) => {
      tracing::debug!("idle connection closed");
      return None;
    }
  }
  match tokio::time::timeout(config.read_header_timeout, read_request(reader)).await {
    Ok(Ok(Some(request))) => Some(request),
    Ok(Ok(None)) => None,
    Ok(Err(Error::IO(err))) => {
      tracing::debug!(error = %err, "read failed");
      None
    }
    Ok(Err(err)) => {
      tracing::debug!(error = %err, "malformed request head");
      let _ = reader
        .get_mut()
        .write_all(&status_line(Version::HTTP_11, StatusCode::BAD_REQUEST))
        .await;
      let _ = reader.get_mut().shutdown().await;
      None
    }
    Err(_) => {
      tracing::debug!("timed out reading request head");
      None
    }
  }
}

pub(crate) async fn write_within<W>(writer: &mut W, payload: &[u8], timeout: Duration) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  tokio::time::timeout(timeout, async {
    writer.write_all(payload).await?;
    writer.flush().await
  })
  .await
  .map_err(|_| Error::Timeout(timeout))??;
  Ok(())
}

/// Spawns `handle` for every accepted connection until `shutdown` resolves,
/// then gives in-flight tasks `grace` to finish before aborting them.
pub(crate) async fn accept_loop<S, F, Fut>(
  listener: TcpListener,
  shutdown: S,
  grace: Duration,
  handle: F,
) -> Result<()>
where
  S: Future<Output = ()>,
  F: Fn(TcpStream, SocketAddr) -> Fut,
  Fut: Future<Output = ()> + Send + 'static,
{
  let mut tasks = JoinSet::new();
  tokio::pin!(shutdown);
  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          tasks.spawn(handle(stream, peer));
        }
        Err(err) => tracing::error!(error = %err, "accept failed"),
      },
      Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
        if let Err(err) = joined {
          tracing::error!(error = %err, "connection task failed");
        }
      }
    }
  }
  drop(listener);
  let in_flight = tasks.len();
  if in_flight > 0 {
    tracing::info!(in_flight, "waiting for connections to finish");
  }
  let drain = async { while tasks.join_next().await.is_some() {} };
  if tokio::time::timeout(grace, drain).await.is_err() {
    tracing::warn!(remaining = tasks.len(), "graceful shutdown timed out");
    tasks.abort_all();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::tests::test_root;
  use crate::client::Client;
    use crate::transport::RoundTrip;
  use crate::Response;
  use async_trait::async_trait;
  use tokio::io::AsyncReadExt;

  struct Upstream;

  #[async_trait]
  impl RoundTrip for Upstream {
    async fn round_trip(&self, request: Request) -> Result<Response> {
      if request.uri().host() == Some("down.test") {
        return Err(Error::IO(io::Error::from(io::ErrorKind::ConnectionRefused)));
      }
      Ok(
        Response::builder()
          .status(200)
          .header("content-length", "2")
          .body("ok")?
          .into(),
      )
    }
  }

  fn server() -> ProxyServer {
    let (cert_pem, key_pem) = test_root();
    let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem, "Wiretap").unwrap();
    let client = Client::builder()
      .transport(Arc::new(Upstream))
      .build()
      .unwrap();
    ProxyServer::new(Arc::new(ca), Forwarder::new(client), ListenerConfig::proxy())
  }

  async fn exchange(server: ProxyServer, raw: &[u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      let (stream, peer) = listener.accept().await.unwrap();
      server.handle(stream, peer).await;
    });
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(raw).await.unwrap();
    let mut answer = String::new();
    client.read_to_string(&mut answer).await.unwrap();
    handle.await.unwrap();
    answer
  }

  #[test]
  fn status_lines_follow_the_request_version() {
    assert_eq!(
      status_line(Version::HTTP_10, StatusCode::BAD_GATEWAY),
      Bytes::from_static(b"HTTP/1.0 502 Bad Gateway\r\n\r\n")
    );
    assert_eq!(
      status_line(Version::HTTP_11, StatusCode::INTERNAL_SERVER_ERROR),
      Bytes::from_static(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
    );
  }

  #[test]
  fn classification_is_exhaustive() {
    assert!(matches!(classify(Ok(None)), ReadOutcome::Closed));
    assert!(matches!(
      classify(Ok(Some(Request::default()))),
      ReadOutcome::Request(_)
    ));
    let failed = |kind: io::ErrorKind| -> Result<Option<Request>> { Err(Error::IO(io::Error::from(kind))) };
    assert!(matches!(classify(failed(io::ErrorKind::UnexpectedEof)), ReadOutcome::Closed));
    assert!(matches!(
      classify(failed(io::ErrorKind::ConnectionReset)),
      ReadOutcome::Reset(_)
    ));
    assert!(matches!(
      classify(failed(io::ErrorKind::ConnectionAborted)),
      ReadOutcome::Reset(_)
    ));
    assert!(matches!(classify(failed(io::ErrorKind::TimedOut)), ReadOutcome::Timeout));
    assert!(matches!(
      classify(Err(Error::Timeout(Duration::from_secs(4)))),
      ReadOutcome::Timeout
    ));
    assert!(matches!(
      classify(failed(io::ErrorKind::InvalidData)),
      ReadOutcome::Transport(_)
    ));
    assert!(matches!(
      classify(Err(Error::InvalidRequest("GARBAGE".to_string()))),
      ReadOutcome::Malformed(_)
    ));
  }

  #[tokio::test]
  async fn plain_request_gets_the_upstream_dump() {
    let answer = exchange(
      server(),
      b"GET http://up.test/ HTTP/1.1\r\nHost: up.test\r\n\r\n",
    )
    .await;
    assert_eq!(answer, "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok");
  }

  #[tokio::test]
  async fn unreachable_upstream_is_a_bad_gateway() {
    let answer = exchange(
      server(),
      b"GET http://down.test/ HTTP/1.0\r\nHost: down.test\r\n\r\n",
    )
    .await;
    assert_eq!(answer, "HTTP/1.0 502 Bad Gateway\r\n\r\n");
  }

  #[tokio::test]
  async fn malformed_head_is_a_bad_request() {
    let answer = exchange(server(), b"NONSENSE\r\n\r\n").await;
    assert_eq!(answer, "HTTP/1.1 400 Bad Request\r\n\r\n");
  }

  #[tokio::test]
  async fn shutdown_stops_accepting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let serve = tokio::spawn(async move {
      server()
        .graceful_shutdown_timeout(Duration::from_millis(100))
        .serve(listener, async {
          let _ = rx.await;
        })
        .await
    });
    tx.send(()).unwrap();
    assert!(serve.await.unwrap().is_ok());
  }
}
