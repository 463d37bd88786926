//! Read-only query API over captured exchanges, plus repeat and scan.
//!
//! One request per connection. Every reply is closed after it is written.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Method, StatusCode};
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::audit::{Replayer, Scanner};
use crate::config::ListenerConfig;
use crate::errors::Result;
use crate::record::CapturedExchange;
use crate::server::{accept_loop, read_head, write_within};
use crate::storage::Repository;
use crate::{Request, Response};

#[derive(Serialize)]
struct ErrorBody<'a> {
  status: &'static str,
  error: &'a str,
}

fn reply(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response {
  let content_type =
    HeaderValue::from_str(content_type).unwrap_or(HeaderValue::from_static("text/plain"));
  Response::builder()
    .status(status)
    .header(http::header::CONTENT_TYPE, content_type)
    .header(http::header::CONTENT_LENGTH, body.len())
    .header(http::header::CONNECTION, "close")
    .body(body)
    .map(Response::from)
    .unwrap_or_default()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response {
  match serde_json::to_vec(value) {
    Ok(body) => reply(status, mime::APPLICATION_JSON.as_ref(), body),
    Err(err) => {
      tracing::error!(error = %err, "failed to encode reply");
      error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
  }
}

fn error(status: StatusCode, message: &str) -> Response {
  let body = serde_json::to_vec(&ErrorBody {
    status: "Error",
    error: message,
  })
  .unwrap_or_default();
  reply(status, mime::APPLICATION_JSON.as_ref(), body)
}

/// The query API listener.
#[derive(Clone)]
pub struct ApiServer {
  repository: Arc<dyn Repository>,
  replayer: Replayer,
  scanner: Scanner,
  config: ListenerConfig,
  graceful_shutdown_timeout: Duration,
}

impl ApiServer {
  /// API over `repository`, repeating with `replayer` and probing with `scanner`.
  pub fn new(
    repository: Arc<dyn Repository>,
    replayer: Replayer,
    scanner: Scanner,
    config: ListenerConfig,
  ) -> Self {
    ApiServer {
      repository,
      replayer,
      scanner,
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
    tracing::info!(address = %listener.local_addr()?, "api listening");
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

  async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
    let mut reader = BufReader::new(stream);
    let Some(request) = read_head(&mut reader, &self.config).await else {
      return;
    };
    let response = self.route(&request).await;
    tracing::info!(
      %peer,
      method = %request.method(),
      path = request.uri().path(),
      status = response.status_code().as_u16(),
      "api request"
    );
    let stream = reader.get_mut();
    if let Err(err) = write_within(stream, &response.to_raw(), self.config.write_timeout).await {
      tracing::warn!(error = %err, "failed to write api reply");
    }
    let _ = stream.shutdown().await;
  }

  /// Dispatch one API request.
  pub async fn route(&self, request: &Request) -> Response {
    if request.method() != Method::GET {
      return error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let segments: Vec<&str> = request.uri().path().trim_matches('/').split('/').collect();
    match segments.as_slice() {
      [""] => reply(
        StatusCode::OK,
        mime::TEXT_PLAIN_UTF_8.as_ref(),
        b"wiretap: /requests, /request/:id, /repeat/:id, /scan/:id".to_vec(),
      ),
      ["requests"] => match self.repository.read_all().await {
        Ok(exchanges) => json(StatusCode::OK, &exchanges),
        Err(err) => {
          tracing::error!(error = %err, "failed to list exchanges");
          error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
      },
      ["request", id] => match self.lookup(id).await {
        Ok(exchange) => json(StatusCode::OK, &exchange),
        Err(response) => response,
      },
      ["repeat", id] => match self.lookup(id).await {
        Ok(exchange) => self.repeat(&exchange).await,
        Err(response) => response,
      },
      ["scan", id] => match self.lookup(id).await {
        Ok(exchange) => match self.scanner.scan(&exchange).await {
          Ok(verdict) => json(StatusCode::OK, &verdict.to_string()),
          Err(err) => {
            tracing::error!(id = exchange.id, error = %err, "scan failed");
            error(StatusCode::FORBIDDEN, &err.to_string())
          }
        },
        Err(response) => response,
      },
      _ => error(StatusCode::NOT_FOUND, "not found"),
    }
  }

  async fn lookup(&self, id: &str) -> std::result::Result<CapturedExchange, Response> {
    // plain decimal digits only; `str::parse` would also take a leading `+`
    let id: u32 = Some(id)
      .filter(|id| id.bytes().all(|b| b.is_ascii_digit()))
      .and_then(|id| id.parse().ok())
      .ok_or_else(|| error(StatusCode::BAD_REQUEST, "bad id"))?;
    self
      .repository
      .read_one(u64::from(id))
      .await
      .map_err(|err| {
        if err.is_not_found() {
          error(StatusCode::NOT_FOUND, &err.to_string())
        } else {
          tracing::error!(id, error = %err, "failed to read exchange");
          error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
      })
  }

  async fn repeat(&self, exchange: &CapturedExchange) -> Response {
    match self.replayer.repeat(exchange).await {
      Ok(response) => {
        let content_type = exchange
          .response
          .content_type()
          .unwrap_or(mime::TEXT_PLAIN.as_ref());
        let body = response
          .body()
          .as_ref()
          .map(|b| b.to_vec())
          .unwrap_or_default();
        reply(StatusCode::OK, content_type, body)
      }
      Err(err) => {
        tracing::error!(id = exchange.id, error = %err, "repeat failed");
        error(StatusCode::CONFLICT, &err.to_string())
      }
    }
  }
}
