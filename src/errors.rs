//! engine error
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `wiretap::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while intercepting, forwarding or storing an exchange.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// IO Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Root material or leaf issuance failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// The peer sent something that is not an HTTP/1.x request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The upstream sent something that is not an HTTP/1.x response
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  /// The outbound call exceeded its deadline
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  /// The outbound call failed, wrapping the cause
  #[error("error in client do: {0}")]
  Forward(#[source] Box<Error>),
  /// No exchange is stored under this identifier
  #[error("request {0} not found")]
  NotFound(u64),
  /// Storage backend failure
  #[error("storage error: {0}")]
  Storage(String),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Wrap a failed outbound call
  pub fn forward(cause: Error) -> Self {
    Error::Forward(Box::new(cause))
  }

  /// Whether this is the distinguished not-found condition
  pub fn is_not_found(&self) -> bool {
    matches!(self, Error::NotFound(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUriParts> for Error {
  fn from(value: http::uri::InvalidUriParts) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
