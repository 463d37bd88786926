//! Re-issuing captured requests: plain replay and a command-injection probe.
//!
//! Both start from the byte-exact `Raw` capture rather than the structural
//! fields, so what goes out again is what the client originally sent.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};

use crate::errors::{Error, Result};
use crate::forward::{change_request_to_target, Scheme, FORWARD_TIMEOUT};
use crate::record::CapturedExchange;
use crate::request::read_request;
use crate::storage::Repository;
use crate::transport::{CapturingTransport, HttpTransport};
use crate::{Client, Request, Response};

/// Header stamped on every replayed request.
pub const REPEATED_HEADER: &str = "x-wiretap-repeated";

/// Shell metacharacter probes, tried in order.
pub const PROBES: [&str; 3] = [";cat /etc/passwd;", "|cat /etc/passwd|", "`cat /etc/passwd`"];

/// A response body containing this means a probe was executed.
pub const MARKER: &str = "root:";

/// Parses a captured `Raw` request into something sendable toward `scheme`.
pub async fn prepare(raw: &str, scheme: Scheme) -> Result<Request> {
  let mut request = read_request(&mut raw.as_bytes())
    .await?
    .ok_or_else(|| Error::invalid_request("captured request is empty"))?;
  *request.request_uri_mut() = None;
  if request.content_length() == Some(0) {
    *request.body_mut() = None;
  }
  let host = request
    .host()
    .ok_or_else(|| Error::invalid_request("captured request has no host"))?;
  change_request_to_target(&mut request, &host, scheme)?;
  Ok(request)
}

/// Replays captured requests through a capturing client, so every replay is
/// itself captured.
#[derive(Debug, Clone)]
pub struct Replayer {
  client: Client,
  scheme: Scheme,
}

impl Replayer {
  /// Replay through `client`, toward HTTPS.
  pub fn new(client: Client) -> Self {
    Replayer {
      client,
      scheme: Scheme::Https,
    }
  }
  /// Replay through a network transport that records into `repository`.
  pub fn capturing(repository: Arc<dyn Repository>, connect_timeout: Duration) -> Result<Self> {
    let transport = CapturingTransport::new(
      HttpTransport::new()?.connect_timeout(connect_timeout),
      repository,
    );
    let client = Client::builder()
      .transport(Arc::new(transport))
      .timeout(FORWARD_TIMEOUT)
      .build()?;
    Ok(Replayer::new(client))
  }
  /// Target scheme for replays.
  pub fn scheme(mut self, scheme: Scheme) -> Self {
    self.scheme = scheme;
    self
  }

  /// Send the captured request again and return the upstream response.
  pub async fn repeat(&self, exchange: &CapturedExchange) -> Result<Response> {
    let mut request = prepare(&exchange.request.raw, self.scheme).await?;
    request.headers_mut().insert(
      HeaderName::from_static(REPEATED_HEADER),
      HeaderValue::from_static("Wiretap"),
    );
    tracing::info!(id = exchange.id, uri = %request.uri(), "repeating request");
    self.client.execute(request).await.map_err(Error::forward)
  }
}

/// Result of probing one captured request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
  /// The probe's output showed up in the response
  Detected(&'static str),
  /// No probe worked
  NotDetected,
}

impl fmt::Display for ScanVerdict {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ScanVerdict::Detected(probe) => write!(f, "Command Injection Detected at {}", probe),
      ScanVerdict::NotDetected => f.write_str("Not Detected"),
    }
  }
}

/// Appends each of [`PROBES`] to every header of a captured request and looks
/// for [`MARKER`] in the response body. Probe traffic is not captured.
#[derive(Debug, Clone)]
pub struct Scanner {
  client: Client,
  scheme: Scheme,
}

impl Scanner {
  /// Probe through `client`, toward HTTPS.
  pub fn new(client: Client) -> Self {
    Scanner {
      client,
      scheme: Scheme::Https,
    }
  }
  /// Probe through a plain network transport.
  pub fn direct(connect_timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .connect_timeout(connect_timeout)
      .timeout(FORWARD_TIMEOUT)
      .build()?;
    Ok(Scanner::new(client))
  }
  /// Target scheme for probes.
  pub fn scheme(mut self, scheme: Scheme) -> Self {
    self.scheme = scheme;
    self
  }

  /// Try every probe in order, stopping at the first hit.
  pub async fn scan(&self, exchange: &CapturedExchange) -> Result<ScanVerdict> {
    for probe in PROBES {
      let request = probed(prepare(&exchange.request.raw, self.scheme).await?, probe)?;
      let response = self.client.execute(request).await.map_err(Error::forward)?;
      if response.text().contains(MARKER) {
        tracing::warn!(id = exchange.id, probe, "command injection detected");
        return Ok(ScanVerdict::Detected(probe));
      }
    }
    Ok(ScanVerdict::NotDetected)
  }
}

fn probed(mut request: Request, probe: &str) -> Result<Request> {
  let value = HeaderValue::from_str(probe)?;
  let names: Vec<HeaderName> = request
    .headers()
    .keys()
    // framing headers are carried once, never probed
    .filter(|name| {
      *name != http::header::HOST
        && *name != http::header::CONTENT_LENGTH
        && *name != http::header::TRANSFER_ENCODING
    })
    .cloned()
    .collect();
  for name in names {
    request.headers_mut().append(name, value.clone());
  }
  Ok(request)
}
