use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::Body;
use crate::cookies;
use crate::errors::{Error, Result};
use crate::{Request, COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{Method, Response as HttpResponse, StatusCode};

/// Upper bound on the size of a response or request head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a single start line or chunk-size line.
pub const MAX_LINE_SIZE: usize = 8 * 1024;

/// Upper bound on a buffered message body, whatever its framing.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// A Response to a submitted `Request`.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  status_code: StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Byte-exact dump of status line, headers and body.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(format!("{}", self.status_code).as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
}

impl Response {
  /// Retrieve the cookies set by the response.
  ///
  /// Invalid `Set-Cookie` headers are ignored.
  pub fn cookies(&self) -> std::collections::BTreeMap<String, String> {
    cookies::response_cookies(&self.headers)
  }
  /// Lossy UTF-8 view of the body.
  pub fn text(&self) -> String {
    self.body.as_ref().map(Body::text).unwrap_or_default()
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the final `http::Uri` of this `Response`.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  #[inline]
  pub(crate) fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
}

/// A builder that parses a `Response` off the wire.
#[derive(Debug)]
pub struct ResponseBuilder<T: AsyncRead> {
  builder: http::response::Builder,
  reader: BufReader<T>,
  config: ResponseConfig,
}

/// response config
#[derive(Debug)]
pub struct ResponseConfig {
  method: Method,
  max_body: usize,
}

impl Default for ResponseConfig {
  fn default() -> Self {
    ResponseConfig {
      method: Method::default(),
      max_body: MAX_BODY_SIZE,
    }
  }
}

impl ResponseConfig {
  /// new a response config
  pub fn new(request: &Request) -> Self {
    ResponseConfig {
      method: request.method().clone(),
      ..Default::default()
    }
  }
  /// Refuse bodies larger than `max` bytes. Unframed bodies stop there.
  pub fn max_body(mut self, max: usize) -> Self {
    self.max_body = max;
    self
  }
}

impl<T: AsyncRead + Unpin + Sized> ResponseBuilder<T> {
  /// Constructs a new response.
  pub fn new(reader: BufReader<T>, config: ResponseConfig) -> ResponseBuilder<T> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      config,
    }
  }
  async fn parser_version(&mut self) -> Result<(http::Version, StatusCode)> {
    let mut line = Vec::new();
    let length = read_line(&mut self.reader, &mut line)
      .await
      .map_err(invalid_response)?;
    if length == 0 {
      return Err(Error::InvalidResponse("empty response".to_string()));
    }
    let line = line.strip_suffix(b"\n").unwrap_or(&line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      _ => {
        return Err(Error::InvalidResponse(format!(
          "invalid status line: {}",
          line.escape_ascii()
        )));
      }
    };
    let status_code = match parts.next() {
      Some(sc) if !sc.is_empty() => StatusCode::from_bytes(sc)?,
      _ => {
        return Err(Error::InvalidResponse(
          "missing status code".to_string(),
        ));
      }
    };
    Ok((version, status_code))
  }
  async fn read_headers(&mut self) -> Result<http::HeaderMap> {
    read_header_block(&mut self.reader)
      .await?
      .ok_or_else(|| Error::InvalidResponse("unterminated header block".to_string()))
  }
  async fn read_body(&mut self, status: StatusCode, header: &http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.config.method, Method::HEAD)
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(body);
    }
    let max = self.config.max_body;
    if is_chunked(header) {
      return read_chunked_body(&mut self.reader, max)
        .await
        .map_err(invalid_response);
    }
    match content_length(header).map_err(invalid_response)? {
      Some(length) => read_sized_body(&mut self.reader, length, max)
        .await
        .map_err(invalid_response),
      None => {
        (&mut self.reader)
          .take(max as u64)
          .read_to_end(&mut body)
          .await?;
        Ok(body)
      }
    }
  }

  /// Read a full `Response` off the underlying stream.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c) = self.parser_version().await?;
    self.builder = self.builder.version(v).status(c);
    let mut header = self.read_headers().await?;
    let body = self.read_body(c, &header).await?;
    if is_chunked(&header) {
      // the body is now de-chunked and buffered
      header.remove(http::header::TRANSFER_ENCODING);
    }
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let resp = self.builder.body(body)?;
    Ok(resp.into())
  }
}

fn invalid_response(err: Error) -> Error {
  match err {
    Error::IO(err) => Error::IO(err),
    other => Error::InvalidResponse(other.to_string()),
  }
}

/// Reads one `\n`-terminated line of at most [`MAX_LINE_SIZE`] bytes.
/// Returns 0 at end of stream.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  line: &mut Vec<u8>,
) -> Result<usize> {
  let length = (&mut *reader)
    .take(MAX_LINE_SIZE as u64)
    .read_until(b'\n', line)
    .await?;
  if length == MAX_LINE_SIZE && !line.ends_with(b"\n") {
    return Err(Error::Other("line too long".to_string()));
  }
  Ok(length)
}

/// Reads a body of exactly `length` bytes, refusing anything over `max`
/// before allocating.
pub(crate) async fn read_sized_body<R: AsyncRead + Unpin>(
  reader: &mut R,
  length: usize,
  max: usize,
) -> Result<Vec<u8>> {
  if length > max {
    return Err(Error::Other(format!(
      "body of {} bytes exceeds the {} byte limit",
      length, max
    )));
  }
  let mut body = Vec::new();
  (&mut *reader)
    .take(length as u64)
    .read_to_end(&mut body)
    .await?;
  if body.len() < length {
    return Err(Error::IO(std::io::Error::from(
      std::io::ErrorKind::UnexpectedEof,
    )));
  }
  Ok(body)
}

pub(crate) fn is_chunked(header: &http::HeaderMap) -> bool {
  header
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn content_length(header: &http::HeaderMap) -> Result<Option<usize>> {
  match header.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| Error::Other(format!("bad content-length: {:?}", value))),
  }
}

/// Reads header lines up to the blank line. `None` means the stream ended first.
pub(crate) async fn read_header_block<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<http::HeaderMap>> {
  let mut headers = http::HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0;
  loop {
    header_line.clear();
    let length = read_line(reader, &mut header_line).await?;
    if length == 0 {
      return Ok(None);
    }
    total += length;
    if total > MAX_HEAD_SIZE {
      return Err(Error::Other("header block too large".to_string()));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      return Ok(Some(headers));
    }
    if let (Some(k), Some(v)) = parser_headers(&header_line)? {
      headers.append(k, v);
    }
  }
}

/// Decodes a chunked body of at most `max` bytes, consuming any trailer section.
pub(crate) async fn read_chunked_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  max: usize,
) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if read_line(reader, &mut line).await? == 0 {
      return Err(Error::Other("unexpected eof in chunked body".to_string()));
    }
    let size = String::from_utf8_lossy(&line);
    let size = size.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size, 16)
      .map_err(|_| Error::Other(format!("bad chunk size: {}", size)))?;
    if size == 0 {
      break;
    }
    let remaining = max - body.len();
    let chunk = read_sized_body(reader, size, remaining).await?;
    body.extend_from_slice(&chunk);
    line.clear();
    read_line(reader, &mut line).await?;
  }
  // trailers
  loop {
    line.clear();
    let length = read_line(reader, &mut line).await?;
    if length == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
  }
  Ok(body)
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => k = Some(http::HeaderName::from_bytes(h)?),
      1 => v = Some(http::HeaderValue::from_bytes(h)?),
      _ => {}
    }
  }
  Ok((k, v))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn head_request() -> Request {
    http::Request::builder()
      .method(Method::HEAD)
      .uri("http://example.com/")
      .body(Vec::new())
      .map(Request::from)
      .unwrap()
  }

  async fn parse(raw: &'static [u8], request: &Request) -> Result<Response> {
    ResponseBuilder::new(BufReader::new(raw), ResponseConfig::new(request))
      .build()
      .await
  }

  #[tokio::test]
  async fn content_length_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nokEXTRA";
    let resp = parse(raw, &Request::default()).await.unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.text(), "ok");
    assert_eq!(resp.headers()["content-type"], "text/plain");
  }

  #[tokio::test]
  async fn chunked_body_is_decoded() {
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
    let resp = parse(raw, &Request::default()).await.unwrap();
    assert_eq!(resp.text(), "wikipedia");
    assert!(resp.headers().get(http::header::TRANSFER_ENCODING).is_none());
  }

  #[tokio::test]
  async fn unframed_body_reads_to_eof() {
    let raw = b"HTTP/1.0 404 Not Found\r\nServer: x\r\n\r\nmissing page";
    let resp = parse(raw, &Request::default()).await.unwrap();
    assert_eq!(resp.version(), http::Version::HTTP_10);
    assert_eq!(resp.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(resp.text(), "missing page");
  }

  #[tokio::test]
  async fn head_and_no_content_have_no_body() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
    let resp = parse(raw, &head_request()).await.unwrap();
    assert!(resp.body().is_none());
    assert_eq!(resp.content_length(), Some(10));
    let raw = b"HTTP/1.1 204 No Content\r\n\r\nignored";
    let resp = parse(raw, &Request::default()).await.unwrap();
    assert!(resp.body().is_none());
  }

  #[tokio::test]
  async fn rejects_garbage() {
    assert!(parse(b"", &Request::default()).await.is_err());
    assert!(parse(b"SSH-2.0-OpenSSH\r\n\r\n", &Request::default()).await.is_err());
  }

  #[tokio::test]
  async fn oversized_upstream_lengths_are_refused() {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\n";
    let err = parse(raw, &Request::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\n";
    let err = parse(raw, &Request::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
  }

  #[tokio::test]
  async fn body_limit_is_configurable() {
    let config = || ResponseConfig::new(&Request::default()).max_body(4);
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let err = ResponseBuilder::new(BufReader::new(raw), config())
      .build()
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
    let raw: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nhello world";
    let resp = ResponseBuilder::new(BufReader::new(raw), config())
      .build()
      .await
      .unwrap();
    assert_eq!(resp.text(), "hell");
  }

  #[tokio::test]
  async fn endless_status_line_is_refused() {
    let raw = vec![b'H'; MAX_LINE_SIZE + 1];
    let err = ResponseBuilder::new(
      BufReader::new(raw.as_slice()),
      ResponseConfig::new(&Request::default()),
    )
    .build()
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidResponse(_)));
  }

  #[test]
  fn dump_keeps_status_headers_and_body() {
    let resp: Response = Response::builder()
      .status(502)
      .header("content-type", "text/plain")
      .body("down")
      .unwrap()
      .into();
    assert_eq!(
      resp.to_raw(),
      Bytes::from_static(b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\n\r\ndown")
    );
  }
}
