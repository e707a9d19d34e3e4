//! Attestation token broker service.
//!
//! Serves `/post`, `/exchange`, `/exchangeEnc`, and `/stats` over HTTP, persisting leases to a
//! JSON file. Expired leases are reclaimed at startup and then every hour.

// std
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
// crates.io
use axum::Router;
use clap::Parser;
use color_eyre::Result;
use time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
// self
use gira_broker::{
	broker::{self, DEFAULT_ISSUER, DEFAULT_JWKS_URL, FileLeaseStore, JwksVerifier, TokenBroker},
	config::{DEFAULT_AUTH_URL, LeasePolicy, RetryPolicy},
	http::ReqwestTransport,
	reqwest,
	retry::RetryingTransport,
	tokio_util::sync::CancellationToken,
	upstream::AuthApi,
	url::Url,
};

#[derive(Debug, Parser)]
#[command(name = "token_broker", version, about = "Leases attestation tokens to verified users.")]
struct Cli {
	/// Lease database file.
	#[arg(long, env = "GIRA_BROKER_DB_PATH", default_value = "gira-tokens.json")]
	db_path: PathBuf,
	/// Address to listen on.
	#[arg(long, env = "GIRA_BROKER_BIND", default_value = "0.0.0.0:8080")]
	bind: SocketAddr,
	/// Path prefix under which the routes are mounted.
	#[arg(long, env = "GIRA_BROKER_URL_PREFIX", default_value = "")]
	url_prefix: String,
	/// Key set used to verify deposited tokens.
	#[arg(long, env = "GIRA_BROKER_JWKS_URL", default_value = DEFAULT_JWKS_URL)]
	jwks_url: Url,
	/// Required issuer of deposited tokens.
	#[arg(long, env = "GIRA_BROKER_ISSUER", default_value = DEFAULT_ISSUER)]
	issuer: String,
	/// Upstream auth endpoint used to confirm caller identities.
	#[arg(long, env = "GIRA_BROKER_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
	auth_url: Url,
	/// Minimum remaining validity, in seconds, for an existing assignment to be reused.
	#[arg(long, env = "GIRA_BROKER_LEASE_LEEWAY_SECS", default_value_t = 120)]
	lease_leeway_secs: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.init();

	let cli = Cli::parse();
	let http = reqwest::Client::builder().build()?;
	let store = Arc::new(FileLeaseStore::open(cli.db_path.clone())?);
	let verifier = Arc::new(JwksVerifier::remote(cli.jwks_url, cli.issuer, http.clone()));
	let identity_transport =
		RetryingTransport::bounded(ReqwestTransport::with_client(http), RetryPolicy::default());
	let identity = Arc::new(AuthApi::new(cli.auth_url, Arc::new(identity_transport)));
	let policy = LeasePolicy::default().with_leeway(Duration::seconds(cli.lease_leeway_secs));
	let broker = Arc::new(TokenBroker::new(store, verifier, identity).with_policy(policy));
	let shutdown = CancellationToken::new();
	let maintenance = tokio::spawn({
		let broker = broker.clone();
		let shutdown = shutdown.clone();

		async move { broker.run_maintenance(shutdown).await }
	});
	let app = mount(broker::router(broker), &cli.url_prefix);
	let listener = TcpListener::bind(cli.bind).await?;

	tracing::info!(
		addr = %cli.bind,
		db = %cli.db_path.display(),
		prefix = %cli.url_prefix,
		"Token broker listening."
	);

	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown.clone())).await?;
	shutdown.cancel();
	maintenance.await?;

	Ok(())
}

fn mount(router: Router, prefix: &str) -> Router {
	let prefix = prefix.trim_matches('/');

	if prefix.is_empty() { router } else { Router::new().nest(&format!("/{prefix}"), router) }
}

async fn shutdown_signal(shutdown: CancellationToken) {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::warn!(error = %e, "Ctrl-C handler unavailable.");
			std::future::pending::<()>().await;
		}
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(e) => {
				tracing::warn!(error = %e, "SIGTERM handler unavailable.");
				std::future::pending::<()>().await;
			},
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
		_ = shutdown.cancelled() => {},
	}

	tracing::info!("Shutting down.");
	shutdown.cancel();
}
