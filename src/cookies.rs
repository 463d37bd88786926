use std::collections::BTreeMap;

pub use cookie::Cookie;
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderMap;

/// Name/value pairs from every `Cookie` request header. Unparseable pairs are skipped.
pub fn request_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| Cookie::split_parse(value.to_string()))
    .filter_map(|cookie| cookie.ok())
    .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
    .collect()
}

/// Name/value pairs from every `Set-Cookie` response header.
pub fn response_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
  headers
    .get_all(SET_COOKIE)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .filter_map(|value| Cookie::parse(value.to_string()).ok())
    .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
    .collect()
}

/// Renders pairs as a single `Cookie` header value.
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
  if cookies.is_empty() {
    return None;
  }
  Some(
    cookies
      .iter()
      .map(|(name, value)| Cookie::new(name.as_str(), value.as_str()).to_string())
      .collect::<Vec<_>>()
      .join("; "),
  )
}
