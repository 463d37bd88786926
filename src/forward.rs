//! The forwarding step between an intercepted request and its upstream.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderValue;

use crate::errors::{Error, Result};
use crate::headers::remove_hop_headers;
use crate::storage::Repository;
use crate::transport::{CapturingTransport, HttpTransport};
use crate::{Client, Request};

/// Fixed deadline for one forwarded call.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the proxy a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
  /// Plain proxied HTTP
  Http,
  /// Tunneled through CONNECT and re-terminated
  Https,
}

impl Scheme {
  /// `http` or `https`
  pub fn as_str(&self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }
}

impl fmt::Display for Scheme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Points `request` at `target_host`, keeping path and query.
///
/// HTTPS always gets an absolute `https://` target. Plain HTTP is left alone
/// when it already carries an authority.
pub fn change_request_to_target(
  request: &mut Request,
  target_host: &str,
  scheme: Scheme,
) -> Result<()> {
  if scheme == Scheme::Http && request.uri().authority().is_some() {
    return Ok(());
  }
  if target_host.is_empty() {
    return Err(Error::invalid_request("no target host for request"));
  }
  let path_and_query = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .filter(|pq| pq.starts_with('/'))
    .unwrap_or("/")
    .to_string();
  *request.uri_mut() = http::Uri::builder()
    .scheme(scheme.as_str())
    .authority(target_host)
    .path_and_query(path_and_query)
    .build()?;
  *request.request_uri_mut() = None;
  Ok(())
}

/// Sends intercepted requests upstream and returns byte-exact response dumps.
#[derive(Debug, Clone)]
pub struct Forwarder {
  client: Client,
}

impl Forwarder {
  /// Forward through an existing client.
  pub fn new(client: Client) -> Self {
    Forwarder { client }
  }

  /// Forward through a capturing network transport with no redirect following.
  pub fn capturing(
    repository: Arc<dyn Repository>,
    timeout: Duration,
    connect_timeout: Duration,
  ) -> Result<Self> {
    let transport = CapturingTransport::new(
      HttpTransport::new()?.connect_timeout(connect_timeout),
      repository,
    );
    let client = Client::builder()
      .transport(Arc::new(transport))
      .timeout(timeout)
      .build()?;
    Ok(Forwarder::new(client))
  }

  /// Forward a copy of `request` and dump the upstream response.
  ///
  /// Any failure comes back as [`Error::Forward`] wrapping the cause.
  pub async fn forward(&self, request: &Request, scheme: Scheme) -> Result<Bytes> {
    let mut outbound = request.clone();
    let target = outbound
      .uri()
      .authority()
      .map(|a| a.to_string())
      .or_else(|| outbound.host())
      .unwrap_or_default();
    change_request_to_target(&mut outbound, &target, scheme).map_err(Error::forward)?;
    *outbound.request_uri_mut() = None;
    if outbound.content_length() == Some(0) {
      *outbound.body_mut() = None;
    }
    remove_hop_headers(outbound.headers_mut());
    outbound
      .headers_mut()
      .entry(http::header::USER_AGENT)
      .or_insert(HeaderValue::from_static(""));

    let mut response = self
      .client
      .execute(outbound)
      .await
      .map_err(Error::forward)?;
    remove_hop_headers(response.headers_mut());
    Ok(response.to_raw())
  }
}
