use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::transport::{HttpTransport, RoundTrip};
use crate::{Request, Response};

/// A `Client` sends requests through a [`RoundTrip`] transport, applying a
/// total timeout. Redirects are never followed: a 3xx comes back as is.
///
/// # Examples
///
/// ```rust
/// # async fn run() -> Result<(), wiretap::Error> {
/// use std::time::Duration;
///
/// let client = wiretap::Client::builder()
///   .timeout(Duration::from_secs(30))
///   .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
  inner: Arc<ClientRef>,
}

struct ClientRef {
  transport: Arc<dyn RoundTrip>,
  timeout: Option<Duration>,
}

impl std::fmt::Debug for Client {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Client")
      .field("timeout", &self.inner.timeout)
      .finish()
  }
}

impl Client {
  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::new()
  }
  /// Executes a `Request`.
  ///
  /// # Errors
  ///
  /// Fails if the request still carries the request-line URI it was read with,
  /// if the transport fails, or if the total timeout elapses.
  pub async fn execute(&self, request: Request) -> Result<Response> {
    if request.request_uri().is_some() {
      return Err(Error::invalid_request(
        "request-line uri can't be set in client requests",
      ));
    }
    match self.inner.timeout {
      Some(timeout) => tokio::time::timeout(timeout, self.execute_request(request))
        .await
        .map_err(|_| Error::Timeout(timeout))?,
      None => self.execute_request(request).await,
    }
  }

  async fn execute_request(&self, request: Request) -> Result<Response> {
    self.inner.transport.round_trip(request).await
  }
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
pub struct ClientBuilder {
  config: Config,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ClientBuilder {
  /// Constructs a new `ClientBuilder`.
  pub fn new() -> ClientBuilder {
    ClientBuilder {
      config: Config::default(),
    }
  }
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  ///
  /// Without an explicit transport an [`HttpTransport`] is created.
  pub fn build(self) -> Result<Client> {
    let config = self.config;
    let transport: Arc<dyn RoundTrip> = match config.transport {
      Some(transport) => transport,
      None => {
        let mut transport = HttpTransport::new()?;
        if let Some(timeout) = config.connect_timeout {
          transport = transport.connect_timeout(timeout);
        }
        Arc::new(transport)
      }
    };
    Ok(Client {
      inner: Arc::new(ClientRef {
        transport,
        timeout: config.timeout,
      }),
    })
  }
  /// Send every request through `transport`.
  pub fn transport(mut self, transport: Arc<dyn RoundTrip>) -> ClientBuilder {
    self.config.transport = Some(transport);
    self
  }
  /// Total time allowed for one `execute`.
  pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
    self.config.timeout = Some(timeout);
    self
  }
  /// Set a timeout for only the connect phase of the default transport.
  pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
    self.config.connect_timeout = Some(timeout);
    self
  }
}

#[derive(Default)]
struct Config {
  transport: Option<Arc<dyn RoundTrip>>,
  connect_timeout: Option<Duration>,
  timeout: Option<Duration>,
}
