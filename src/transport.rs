//! Outbound round trips.
//!
//! [`HttpTransport`] talks to the network. [`CapturingTransport`] wraps any
//! other transport and persists every successful exchange.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::record::{CapturedExchange, CapturedRequest, CapturedResponse};
use crate::response::{ResponseBuilder, ResponseConfig};
use crate::storage::Repository;
use crate::{Request, Response};

/// One request in, one response out.
#[async_trait]
pub trait RoundTrip: Send + Sync {
  /// Send `request` and read the complete response.
  async fn round_trip(&self, request: Request) -> Result<Response>;
}

/// Plain TCP or TLS, one connection per request, closed afterwards.
#[derive(Clone)]
pub struct HttpTransport {
  connector: TlsConnector,
  connect_timeout: Option<Duration>,
  nodelay: bool,
}

impl std::fmt::Debug for HttpTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpTransport")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .finish()
  }
}

impl HttpTransport {
  /// Transport whose TLS side accepts any upstream certificate.
  pub fn new() -> Result<Self> {
    Ok(HttpTransport {
      connector: crate::tls::connector()?,
      connect_timeout: None,
      nodelay: true,
    })
  }
  /// Bound the TCP connect phase.
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = Some(timeout);
    self
  }

  async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let connect = TcpStream::connect((host, port));
    let stream = match self.connect_timeout {
      Some(timeout) => tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| Error::Timeout(timeout))??,
      None => connect.await?,
    };
    stream.set_nodelay(self.nodelay)?;
    Ok(stream)
  }
}

#[async_trait]
impl RoundTrip for HttpTransport {
  async fn round_trip(&self, request: Request) -> Result<Response> {
    let uri = request.uri().clone();
    let https = match uri.scheme_str() {
      Some("https") => true,
      Some("http") => false,
      other => {
        return Err(Error::invalid_request(format!(
          "unsupported scheme: {:?}",
          other
        )))
      }
    };
    let host = uri
      .host()
      .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
      .ok_or_else(|| Error::invalid_request(format!("no host in {}", uri)))?;
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let mut outbound = request.clone();
    outbound
      .headers_mut()
      .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    let raw = outbound.to_raw();

    let stream = self.connect(&host, port).await?;
    let mut response = if https {
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| new_io_error(std::io::ErrorKind::InvalidInput, "invalid dnsname"))?;
      let stream = self.connector.connect(server_name, stream).await?;
      exchange(stream, &request, &raw).await?
    } else {
      exchange(stream, &request, &raw).await?
    };
    *response.uri_mut() = uri;
    Ok(response)
  }
}

async fn exchange<S>(mut stream: S, request: &Request, raw: &[u8]) -> Result<Response>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(raw).await?;
  stream.flush().await?;
  ResponseBuilder::new(BufReader::new(stream), ResponseConfig::new(request))
    .build()
    .await
}

/// Records every successful round trip of `inner` in a [`Repository`].
///
/// Failed round trips propagate untouched and leave nothing behind. Storage
/// failures are logged and never fail the round trip.
pub struct CapturingTransport<T> {
  inner: T,
  repository: Arc<dyn Repository>,
}

impl<T: RoundTrip> CapturingTransport<T> {
  /// Wrap `inner`.
  pub fn new(inner: T, repository: Arc<dyn Repository>) -> Self {
    CapturingTransport { inner, repository }
  }
}

#[async_trait]
impl<T: RoundTrip> RoundTrip for CapturingTransport<T> {
  async fn round_trip(&self, request: Request) -> Result<Response> {
    let captured_request = CapturedRequest::parse(&request);
    tracing::info!(
      method = %request.method(),
      host = %captured_request.host,
      path = %captured_request.path,
      "request dump"
    );

    let mut response = self.inner.round_trip(request).await?;

    let length = response.body().as_ref().map(|b| b.len()).unwrap_or_default();
    // a bodiless HEAD answer keeps the length it declared
    if length > 0 || response.content_length().is_none() {
      response
        .headers_mut()
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    let captured_response = CapturedResponse::parse(&response);
    tracing::debug!(status = captured_response.status_code, response = %captured_response.raw, "response dump");

    let exchange = CapturedExchange::new(captured_request, captured_response);
    if let Err(err) = self.repository.create(exchange).await {
      tracing::error!(error = %err, "error while storing exchange");
    }
    Ok(response)
  }
}
