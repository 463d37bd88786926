//! Header hygiene shared by the forward path and the capture model.
use http::header::CONNECTION;
use http::{HeaderMap, HeaderName};

/// Headers that only make sense for a single transport hop.
pub const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Removes hop-by-hop headers: anything named by `Connection`, then the fixed set.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
  let named: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in named {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// `content-type` -> `Content-Type`
pub fn canonical_header_key(name: &str) -> String {
  name
    .split('-')
    .map(|part| {
      let mut chars = part.chars();
      match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join("-")
}
