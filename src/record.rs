//! The captured exchange model: what gets persisted for every forwarded request.
use std::collections::BTreeMap;

use http::{HeaderMap, HeaderValue, Method};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cookies::{cookie_header, request_cookies, response_cookies};
use crate::errors::Result;
use crate::headers::canonical_header_key;
use crate::{Request, Response};

/// Multi-valued string map, as used for query, form and header fields.
pub type Values = BTreeMap<String, Vec<String>>;

const FORM: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'.')
  .remove(b'_')
  .remove(b'~')
  .remove(b' ');

/// One request/response pair, persisted exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedExchange {
  /// Storage id, 1-based; 0 until stored
  #[serde(rename = "ID")]
  pub id: u64,
  /// Set by storage on insert
  #[serde(rename = "CreatedAt", with = "time::serde::rfc3339")]
  pub created_at: OffsetDateTime,
  /// What was sent upstream
  #[serde(rename = "Request")]
  pub request: CapturedRequest,
  /// What came back
  #[serde(rename = "Response")]
  pub response: CapturedResponse,
}

impl CapturedExchange {
  /// An exchange not yet assigned an id by storage.
  pub fn new(request: CapturedRequest, response: CapturedResponse) -> Self {
    CapturedExchange {
      id: 0,
      created_at: OffsetDateTime::now_utc(),
      request,
      response,
    }
  }
}

/// Structural view of a forwarded request plus its raw dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CapturedRequest {
  /// Request method, e.g. `GET`
  pub method: String,
  /// URI path without the query
  pub path: String,
  /// `Host` header, or the URI authority
  pub host: String,
  /// Decoded query parameters
  pub get_params: Values,
  /// Headers by canonical name, `Host` excluded
  pub headers: Values,
  /// Request cookies by name
  pub cookies: BTreeMap<String, String>,
  /// Decoded form body, for url-encoded POST/PUT/PATCH only
  pub post_params: Values,
  /// Body as lossy UTF-8
  pub body: String,
  /// Byte-exact dump of the request as sent
  pub raw: String,
}

/// Structural view of an upstream response plus its raw dump.
///
/// `post_params` has no wire counterpart and stays empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CapturedResponse {
  /// Numeric status
  pub status_code: u16,
  /// Headers by canonical name
  pub headers: Values,
  /// `Set-Cookie` values by cookie name
  pub cookies: BTreeMap<String, String>,
  /// Always empty
  pub post_params: Values,
  /// Body as lossy UTF-8
  pub body: String,
  /// Byte-exact dump of the response as received
  pub raw: String,
}

impl CapturedRequest {
  /// Best-effort structural parse. Never fails; unparseable parts come back empty.
  pub fn parse(request: &Request) -> Self {
    let body = request.body().map(|b| b.text()).unwrap_or_default();
    let post_params = if is_form(request) {
      parse_form(&body)
    } else {
      Values::new()
    };
    CapturedRequest {
      method: request.method().to_string(),
      path: request.uri().path().to_string(),
      host: request.host().unwrap_or_default(),
      get_params: request.uri().query().map(parse_form).unwrap_or_default(),
      headers: header_values(request.headers()),
      cookies: request_cookies(request.headers()),
      post_params,
      body,
      raw: String::from_utf8_lossy(&request.to_raw()).into_owned(),
    }
  }
}

impl CapturedResponse {
  /// Structural parse of a fully buffered response.
  pub fn parse(response: &Response) -> Self {
    CapturedResponse {
      status_code: response.status_code().as_u16(),
      headers: header_values(response.headers()),
      cookies: response_cookies(response.headers()),
      post_params: Values::new(),
      body: response.text(),
      raw: String::from_utf8_lossy(&response.to_raw()).into_owned(),
    }
  }

  /// The stored `Content-Type`, if one was captured.
  pub fn content_type(&self) -> Option<&str> {
    self
      .headers
      .get("Content-Type")
      .and_then(|v| v.first())
      .map(|v| v.as_str())
  }
}

/// Rebuilds a sendable request from the structural fields, not from `raw`.
///
/// Targets `http://{host}{path}`. A stored body wins over POST params; otherwise
/// POST params are form-encoded into the body.
pub fn decode(captured: &CapturedRequest) -> Result<Request> {
  let mut target = format!("http://{}{}", captured.host, captured.path);
  if captured.path.is_empty() {
    target.push('/');
  }
  if !captured.get_params.is_empty() {
    target.push('?');
    target.push_str(&encode_form(&captured.get_params));
  }
  let body = if !captured.body.is_empty() {
    captured.body.clone().into_bytes()
  } else if !captured.post_params.is_empty() {
    encode_form(&captured.post_params).into_bytes()
  } else {
    Vec::new()
  };
  let mut request: Request = Request::builder()
    .method(Method::from_bytes(captured.method.as_bytes())?)
    .uri(target)
    .body(body)?
    .into();
  let headers = request.headers_mut();
  for (name, values) in &captured.headers {
    let name = http::HeaderName::from_bytes(name.as_bytes())?;
    for value in values {
      headers.append(name.clone(), HeaderValue::from_str(value)?);
    }
  }
  if let Some(cookie) = cookie_header(&captured.cookies) {
    headers.append(http::header::COOKIE, HeaderValue::from_str(&cookie)?);
  }
  if captured.body.is_empty() && !captured.post_params.is_empty() {
    headers
      .entry(http::header::CONTENT_TYPE)
      .or_insert(HeaderValue::from_static("application/x-www-form-urlencoded"));
  }
  Ok(request)
}

fn is_form(request: &Request) -> bool {
  if !matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
    return false;
  }
  request
    .headers()
    .get(http::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<mime::Mime>().ok())
    .map(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
    .unwrap_or(false)
}

fn header_values(headers: &HeaderMap) -> Values {
  let mut values = Values::new();
  for (name, value) in headers.iter() {
    if name == http::header::HOST {
      continue;
    }
    values
      .entry(canonical_header_key(name.as_str()))
      .or_default()
      .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
  }
  values
}

/// Parses `a=1&b=2&a=3` style data, decoding `+` and percent escapes.
pub fn parse_form(input: &str) -> Values {
  let mut values = Values::new();
  for pair in input.split('&').filter(|p| !p.is_empty()) {
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    values
      .entry(form_decode(key))
      .or_default()
      .push(form_decode(value));
  }
  values
}

fn form_decode(s: &str) -> String {
  percent_decode_str(&s.replace('+', " "))
    .decode_utf8_lossy()
    .into_owned()
}

/// Encodes in key order, spaces as `+`.
pub fn encode_form(values: &Values) -> String {
  let mut pairs = Vec::new();
  for (key, list) in values {
    for value in list {
      pairs.push(format!("{}={}", form_encode(key), form_encode(value)));
    }
  }
  pairs.join("&")
}

fn form_encode(s: &str) -> String {
  utf8_percent_encode(s, FORM).to_string().replace(' ', "+")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Request {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
      builder = builder.header(*k, *v);
    }
    builder.body(body.to_string()).unwrap().into()
  }

  #[test]
  fn parses_structure_and_raw() {
    let req = request(
      Method::POST,
      "http://shop.test/cart?item=42&item=7&q=a+b",
      &[
        ("host", "shop.test"),
        ("content-type", "application/x-www-form-urlencoded; charset=utf-8"),
        ("cookie", "sid=xyz"),
        ("x-custom", "1"),
      ],
      "qty=2&note=hello%20world",
    );
    let captured = CapturedRequest::parse(&req);
    assert_eq!(captured.method, "POST");
    assert_eq!(captured.path, "/cart");
    assert_eq!(captured.host, "shop.test");
    assert_eq!(captured.get_params["item"], vec!["42", "7"]);
    assert_eq!(captured.get_params["q"], vec!["a b"]);
    assert_eq!(captured.cookies["sid"], "xyz");
    assert_eq!(captured.post_params["note"], vec!["hello world"]);
    assert_eq!(captured.headers["X-Custom"], vec!["1"]);
    assert!(!captured.headers.contains_key("Host"));
    assert!(captured.raw.starts_with("POST /cart?item=42&item=7&q=a+b HTTP/1.1\r\n"));
    assert!(captured.raw.ends_with("qty=2&note=hello%20world"));
  }

  #[test]
  fn post_params_need_form_content_type() {
    let req = request(
      Method::POST,
      "http://api.test/",
      &[("content-type", "application/json")],
      "{\"a\":1}",
    );
    assert!(CapturedRequest::parse(&req).post_params.is_empty());
    let req = request(
      Method::GET,
      "http://api.test/",
      &[("content-type", "application/x-www-form-urlencoded")],
      "a=1",
    );
    assert!(CapturedRequest::parse(&req).post_params.is_empty());
  }

  #[test]
  fn decode_restores_structural_fields() {
    let req = request(
      Method::GET,
      "http://example.com/search?lang=en&q=rust",
      &[("host", "example.com"), ("accept", "text/html"), ("x-b", "1"), ("x-b", "2")],
      "",
    );
    let decoded = decode(&CapturedRequest::parse(&req)).unwrap();
    assert_eq!(decoded.method(), req.method());
    assert_eq!(decoded.host(), req.host());
    assert_eq!(decoded.uri().path(), "/search");
    assert_eq!(decoded.uri().query(), Some("lang=en&q=rust"));
    let mut expected = req.headers().clone();
    expected.remove(http::header::HOST);
    assert_eq!(decoded.headers(), &expected);
    assert!(decoded.body().is_none());
  }

  #[test]
  fn decode_reattaches_cookies_and_form() {
    let mut captured = CapturedRequest {
      method: "POST".to_string(),
      path: "/login".to_string(),
      host: "auth.test".to_string(),
      ..Default::default()
    };
    captured.cookies.insert("sid".to_string(), "1".to_string());
    captured
      .post_params
      .insert("user".to_string(), vec!["a b".to_string()]);
    let decoded = decode(&captured).unwrap();
    assert_eq!(decoded.uri().to_string(), "http://auth.test/login");
    assert_eq!(decoded.headers()[http::header::COOKIE], "sid=1");
    assert_eq!(
      decoded.headers()[http::header::CONTENT_TYPE],
      "application/x-www-form-urlencoded"
    );
    assert_eq!(decoded.body().map(|b| b.text()), Some("user=a+b".to_string()));
  }

  #[test]
  fn response_parse_and_json_shape() {
    let resp: Response = Response::builder()
      .status(200)
      .header("content-type", "text/plain")
      .header("set-cookie", "seen=1; Path=/")
      .body("ok")
      .unwrap()
      .into();
    let captured = CapturedResponse::parse(&resp);
    assert_eq!(captured.status_code, 200);
    assert_eq!(captured.content_type(), Some("text/plain"));
    assert_eq!(captured.cookies["seen"], "1");
    assert!(captured.post_params.is_empty());
    assert_eq!(captured.body, "ok");

    let exchange = CapturedExchange::new(CapturedRequest::default(), captured);
    let json = serde_json::to_value(&exchange).unwrap();
    assert!(json.get("ID").is_some());
    assert!(json["CreatedAt"].is_string());
    assert_eq!(json["Response"]["StatusCode"], 200);
    assert!(json["Response"]["PostParams"].is_object());
    assert!(json["Request"]["GetParams"].is_object());
    let back: CapturedExchange = serde_json::from_value(json).unwrap();
    assert_eq!(back.response, exchange.response);
  }
}
