#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # wiretap
//!
//! A TLS-intercepting HTTP proxy that records every exchange it forwards.
//!
//! Plain proxied requests are forwarded as they are. A `CONNECT` is answered
//! with `200 OK`, after which the proxy terminates TLS itself with a leaf
//! certificate issued on the spot by its [`CertificateAuthority`], reads the
//! single tunneled request, and forwards it to the real host. Each successful
//! upstream round trip is stored as a [`CapturedExchange`] through a
//! [`Repository`].
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wiretap::ca::CertificateAuthority;
//! use wiretap::config::ListenerConfig;
//! use wiretap::forward::Forwarder;
//! use wiretap::server::ProxyServer;
//! use wiretap::storage::MemoryRepository;
//!
//! # async fn run() -> wiretap::Result<()> {
//! let ca = CertificateAuthority::new("certs/ca.crt", "certs/ca.key", "Wiretap").await?;
//! let repository = Arc::new(MemoryRepository::new());
//! let forwarder = Forwarder::capturing(
//!   repository,
//!   std::time::Duration::from_secs(30),
//!   std::time::Duration::from_secs(10),
//! )?;
//! let server = ProxyServer::new(Arc::new(ca), forwarder, ListenerConfig::proxy());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:62801").await?;
//! server.serve(listener, std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Captured exchanges
//!
//! Stored exchanges are served as JSON by the [`api::ApiServer`], which can
//! also replay them ([`audit::Replayer`]) or probe them for command
//! injection ([`audit::Scanner`]).
mod body;
mod client;
mod cookies;
mod errors;
mod request;
mod response;

/// Query API listener
pub mod api;
/// Replay and command-injection probing of captured requests
pub mod audit;
/// Leaf certificate issuance
pub mod ca;
/// Process configuration
pub mod config;
/// Forwarding intercepted requests upstream
pub mod forward;
/// Hop-by-hop header handling
pub mod headers;
/// Captured exchange model
pub mod record;
/// Proxy listener and connection hijacking
pub mod server;
/// Exchange persistence
pub mod storage;
/// TLS configuration
pub mod tls;
/// Outbound round trips
pub mod transport;

pub use body::Body;
pub use ca::CertificateAuthority;
pub use client::{Client, ClientBuilder};
pub use errors::{Error, Result};
pub use http;
pub use record::CapturedExchange;
pub use request::{read_request, Request};
pub use response::{Response, ResponseBuilder, ResponseConfig};
pub use storage::Repository;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
