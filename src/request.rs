use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::{
  content_length, is_chunked, read_chunked_body, read_header_block, read_line, read_sized_body,
  MAX_BODY_SIZE,
};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An HTTP/1.x request, either read off a client connection or built to be sent upstream.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  request_uri: Option<String>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .field("request_uri", &self.request_uri)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      request_uri: None,
    }
  }
}

impl Request {
  /// Byte-exact dump of the request as it goes on the wire (origin form).
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(authority.as_str().as_bytes());
      }
    } else {
      http_requests.extend(self.uri.path().as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend(b"?");
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    // Host goes first when the header map does not carry one
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      if let Some(s) = self.uri.authority() {
        http_requests.extend(s.as_str().as_bytes());
      }
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if let Some(b) = self.body() {
      if !b.is_empty() && !headers.contains_key(http::header::TRANSFER_ENCODING) {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// The HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The target URI. Absolute once the request has been re-targeted.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Mutable access to the target URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// The header map.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the header map.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The buffered body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Mutable access to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
  /// The unmodified request-target as the client sent it.
  ///
  /// Only requests read off a connection carry one; it must be cleared
  /// before the request can be sent by a `Client`.
  #[inline]
  pub fn request_uri(&self) -> Option<&str> {
    self.request_uri.as_deref()
  }
  /// Mutable access to the request-target.
  #[inline]
  pub fn request_uri_mut(&mut self) -> &mut Option<String> {
    &mut self.request_uri
  }
  /// The host the request is addressed to: the `Host` header, else the URI authority.
  pub fn host(&self) -> Option<String> {
    self
      .headers
      .get(http::header::HOST)
      .and_then(|h| h.to_str().ok())
      .filter(|h| !h.is_empty())
      .map(|h| h.to_string())
      .or_else(|| self.uri.authority().map(|a| a.to_string()))
  }
  /// Declared `Content-Length`, if any.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
}

/// Reads one HTTP/1.x request (head and body) from `reader`.
///
/// Returns `Ok(None)` when the stream ends before any byte is read.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
  let mut line = Vec::new();
  if read_line(reader, &mut line).await.map_err(malformed)? == 0 {
    return Ok(None);
  }
  let request_line = line
    .strip_suffix(b"\n")
    .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
    .ok_or_else(|| Error::invalid_request("unterminated request line"))?;
  let request_line = std::str::from_utf8(request_line)
    .map_err(|_| Error::invalid_request("request line is not utf-8"))?;
  let mut parts = request_line.split(' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
    _ => {
      return Err(Error::invalid_request(format!(
        "malformed request line: {}",
        request_line.escape_debug()
      )));
    }
  };
  let version = match version {
    "HTTP/1.0" => Version::HTTP_10,
    "HTTP/1.1" => Version::HTTP_11,
    other => {
      return Err(Error::invalid_request(format!(
        "unsupported protocol version: {}",
        other.escape_debug()
      )));
    }
  };
  let method = Method::from_bytes(method.as_bytes())?;
  let uri: http::Uri = target.parse()?;
  let headers = read_header_block(reader)
    .await
    .map_err(malformed)?
    .ok_or_else(|| Error::invalid_request("unexpected eof in header block"))?;
  let body = if is_chunked(&headers) {
    read_chunked_body(reader, MAX_BODY_SIZE)
      .await
      .map_err(malformed)?
  } else {
    let length = content_length(&headers).map_err(malformed)?;
    read_sized_body(reader, length.unwrap_or_default(), MAX_BODY_SIZE)
      .await
      .map_err(malformed)?
  };
  let mut headers = headers;
  if is_chunked(&headers) {
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
  }
  Ok(Some(Request {
    uri,
    version,
    method,
    headers,
    body: if body.is_empty() {
      None
    } else {
      Some(body.into())
    },
    request_uri: Some(target.to_string()),
  }))
}

fn malformed(err: Error) -> Error {
  match err {
    Error::IO(err) => Error::IO(err),
    other => Error::invalid_request(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  async fn read(raw: &'static [u8]) -> Result<Option<Request>> {
    read_request(&mut BufReader::new(raw)).await
  }

  #[tokio::test]
  async fn reads_origin_form_request_with_body() {
    let req = read(b"POST /login?next=%2F HTTP/1.1\r\nHost: example.com\r\nContent-Length: 7\r\n\r\na=1&b=2")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.uri().path(), "/login");
    assert_eq!(req.uri().query(), Some("next=%2F"));
    assert_eq!(req.request_uri(), Some("/login?next=%2F"));
    assert_eq!(req.host().as_deref(), Some("example.com"));
    assert_eq!(req.body().map(|b| b.text()), Some("a=1&b=2".to_string()));
  }

  #[tokio::test]
  async fn reads_connect_authority() {
    let req = read(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(req.method(), Method::CONNECT);
    assert_eq!(
      req.uri().authority().map(|a| a.as_str()),
      Some("example.com:443")
    );
    assert!(req.body().is_none());
  }

  #[tokio::test]
  async fn chunked_request_body_is_buffered() {
    let req = read(b"PUT /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(req.body().map(|b| b.text()), Some("abc".to_string()));
    assert!(req.headers().get(http::header::TRANSFER_ENCODING).is_none());
    assert_eq!(req.content_length(), Some(3));
  }

  #[tokio::test]
  async fn clean_eof_is_none() {
    assert!(read(b"").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn malformed_requests_fail() {
    assert!(read(b"GET / HTTP/2.0\r\n\r\n").await.is_err());
    assert!(read(b"garbage\r\n\r\n").await.is_err());
    assert!(read(b"GET / HTTP/1.1\r\nHost: x\r\n").await.is_err());
  }

  #[tokio::test]
  async fn oversized_lengths_are_refused_before_reading() {
    let err = read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 18446744073709551615\r\n\r\n")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    let err = read(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    let err = read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 99999999999999999999999\r\n\r\n")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[tokio::test]
  async fn chunks_adding_up_past_the_limit_are_refused() {
    let raw = format!(
      "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n{:x}\r\n",
      MAX_BODY_SIZE
    );
    let err = read_request(&mut BufReader::new(raw.as_bytes()))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[tokio::test]
  async fn endless_request_line_is_refused() {
    let raw = vec![b'G'; crate::response::MAX_LINE_SIZE * 2];
    let err = read_request(&mut BufReader::new(raw.as_slice()))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[tokio::test]
  async fn truncated_body_is_an_eof() {
    let err = read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nabc")
      .await
      .unwrap_err();
    assert!(matches!(err, Error::IO(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
  }

  #[test]
  fn dump_adds_host_and_content_length() {
    let req: Request = Request::builder()
      .method(Method::POST)
      .uri("http://example.com/submit?q=1")
      .body("hello")
      .unwrap()
      .into();
    assert_eq!(
      req.to_raw(),
      Bytes::from_static(
        b"POST /submit?q=1 HTTP/1.1\r\nhost: example.com\r\ncontent-length: 5\r\n\r\nhello"
      )
    );
  }
}
