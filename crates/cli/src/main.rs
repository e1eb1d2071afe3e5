mod args;
mod logging;
mod server;
mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tabchat::{DEFAULT_ASSISTANT_URL, Dispatcher, DispatcherConfig, TabConfig, TabLifecycle};
use tabchat_relay::{
	DEFAULT_ENDPOINT, DedupGate, FileStore, RecordStore, Session, SessionConfig, now_ms,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use args::Cli;
use server::SurfaceHub;
use settings::{Settings, StatePaths};

const DEFAULT_LISTEN_PORT: u16 = 8762;

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let paths = StatePaths::new();
	let mut settings = Settings::load(&paths.config_file);

	if let Some(endpoint) = &cli.endpoint {
		args::validate_endpoint(endpoint)?;
		if cli.save {
			settings.endpoint = Some(endpoint.clone());
			settings
				.save(&paths.config_file)
				.context("saving settings")?;
			info!(target = "tabchat", endpoint = %endpoint, "endpoint saved to settings");
		}
	}

	let endpoint = cli
		.endpoint
		.clone()
		.or_else(|| settings.endpoint.clone())
		.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
	let assistant_url = cli
		.assistant_url
		.clone()
		.or_else(|| settings.assistant_url.clone())
		.unwrap_or_else(|| DEFAULT_ASSISTANT_URL.to_string());
	let listen_port = cli.listen.or(settings.listen_port).unwrap_or(DEFAULT_LISTEN_PORT);

	let hub = Arc::new(SurfaceHub::new());
	let tabs = TabLifecycle::new(
		hub.clone(),
		TabConfig {
			assistant_url: assistant_url.clone(),
			..Default::default()
		},
	);

	let store: Arc<dyn RecordStore> = Arc::new(
		FileStore::new(&paths.requests_dir).context("opening shared request store")?,
	);
	let instance_id = format!("relay_{}_{}", std::process::id(), now_ms());
	let dedup = Arc::new(DedupGate::new(store, instance_id));
	dedup.spawn_gc();

	let (session, mut inbound) = Session::spawn(SessionConfig::new(endpoint.clone()));
	let session = Arc::new(session);

	// Status transitions are broadcast; log them for anyone watching.
	{
		let mut status = session.status();
		tokio::spawn(async move {
			while status.changed().await.is_ok() {
				let current = status.borrow().clone();
				info!(target = "tabchat", status = ?current, "transport status changed");
			}
		});
	}

	let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
	let dispatcher = Arc::new(Dispatcher::new(
		tabs,
		dedup.clone(),
		outbound_tx,
		DispatcherConfig::default(),
	));

	{
		let session = session.clone();
		tokio::spawn(async move {
			while let Some(envelope) = outbound_rx.recv().await {
				if let Err(err) = session.send(envelope) {
					warn!(target = "tabchat", error = %err, "failed to send response envelope");
				}
			}
		});
	}

	{
		let dispatcher = dispatcher.clone();
		tokio::spawn(async move {
			while let Some(envelope) = inbound.recv().await {
				let dispatcher = dispatcher.clone();
				tokio::spawn(async move {
					dispatcher.handle(envelope).await;
				});
			}
		});
	}

	let addr: SocketAddr = ([127, 0, 0, 1], listen_port).into();
	let listener = TcpListener::bind(addr)
		.await
		.with_context(|| format!("binding surface listener on {addr}"))?;
	info!(
		target = "tabchat",
		%addr,
		endpoint = %endpoint,
		assistant_url = %assistant_url,
		"tabchat relay running"
	);

	axum::serve(listener, server::router(hub).into_make_service())
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!(target = "tabchat", "shutting down");
		})
		.await
		.context("surface listener error")?;

	session.abort();
	Ok(())
}
