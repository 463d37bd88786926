use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use wiretap::api::ApiServer;
use wiretap::audit::{Replayer, Scanner};
use wiretap::config::Config;
use wiretap::forward::Forwarder;
use wiretap::server::ProxyServer;
use wiretap::storage::MemoryRepository;
use wiretap::{CertificateAuthority, Repository};

/// TLS-intercepting proxy that records every exchange it forwards.
#[derive(Parser, Debug)]
#[command(name = "wiretap", version, about)]
struct Cli {
  /// JSON configuration file; built-in defaults apply otherwise
  #[arg(short, long, env = "WIRETAP_CONFIG")]
  config: Option<PathBuf>,
  /// Log environment: local, dev or prod
  #[arg(long, env = "WIRETAP_LOG_ENV")]
  log_env: Option<String>,
  /// Proxy listen address
  #[arg(long)]
  proxy_address: Option<String>,
  /// API listen address
  #[arg(long)]
  api_address: Option<String>,
  /// Root CA certificate (PEM)
  #[arg(long)]
  ca_cert: Option<PathBuf>,
  /// Root CA RSA key (PEM)
  #[arg(long)]
  ca_key: Option<PathBuf>,
  /// Organization written into issued leaves
  #[arg(long)]
  organization: Option<String>,
}

impl Cli {
  async fn config(&self) -> wiretap::Result<Config> {
    let mut config = match &self.config {
      Some(path) => Config::load(path).await?,
      None => Config::default(),
    };
    if let Some(log_env) = &self.log_env {
      config.log_env = log_env.clone();
    }
    if let Some(address) = &self.proxy_address {
      config.proxy.address = address.clone();
    }
    if let Some(address) = &self.api_address {
      config.api.address = address.clone();
    }
    if let Some(path) = &self.ca_cert {
      config.cert.ca_cert_file = path.clone();
    }
    if let Some(path) = &self.ca_key {
      config.cert.ca_key_file = path.clone();
    }
    if let Some(organization) = &self.organization {
      config.cert.organization = organization.clone();
    }
    Ok(config)
  }
}

fn init_tracing(log_env: &str) {
  let level = match log_env {
    "local" | "dev" => "debug",
    _ => "info",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
  match log_env {
    "local" => subscriber.pretty().init(),
    _ => subscriber.json().init(),
  }
}

async fn run(config: Config) -> wiretap::Result<()> {
  let ca = CertificateAuthority::new(
    &config.cert.ca_cert_file,
    &config.cert.ca_key_file,
    config.cert.organization.clone(),
  )
  .await?;
  let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

  let forwarder = Forwarder::capturing(
    repository.clone(),
    config.forward_timeout,
    config.connect_timeout,
  )?;
  let proxy = ProxyServer::new(Arc::new(ca), forwarder, config.proxy.clone())
    .graceful_shutdown_timeout(config.graceful_shutdown_timeout);
  let api = ApiServer::new(
    repository.clone(),
    Replayer::capturing(repository, config.connect_timeout)?,
    Scanner::direct(config.connect_timeout)?,
    config.api.clone(),
  )
  .graceful_shutdown_timeout(config.graceful_shutdown_timeout);

  let proxy_listener = TcpListener::bind(&config.proxy.address).await?;
  let api_listener = TcpListener::bind(&config.api.address).await?;

  let (stop, stopped) = watch::channel(false);
  tokio::spawn(async move {
    if let Err(err) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
    let _ = stop.send(true);
  });
  let shutdown = |mut stopped: watch::Receiver<bool>| async move {
    let _ = stopped.wait_for(|stop| *stop).await;
  };

  let (proxy, api) = tokio::join!(
    proxy.serve(proxy_listener, shutdown(stopped.clone())),
    api.serve(api_listener, shutdown(stopped)),
  );
  proxy?;
  api?;
  tracing::info!("stopped");
  Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  let config = match cli.config().await {
    Ok(config) => config,
    Err(err) => {
      eprintln!("wiretap: {}", err);
      return ExitCode::FAILURE;
    }
  };
  init_tracing(&config.log_env);
  tracing::debug!(?config, "configuration loaded");
  match run(config).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      tracing::error!(error = %err, "wiretap failed");
      ExitCode::FAILURE
    }
  }
}
