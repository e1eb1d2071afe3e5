//! WebSocket endpoint that automation surfaces connect to.
//!
//! Each page agent dials `/surface`, registers with a hello frame, and then
//! answers command frames. The hub keeps one [`SurfaceConn`] per connection,
//! correlates command frames to replies by id, and implements the core's
//! [`TargetHost`] capability on top of the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::routing::get;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tabchat::{
	AutomationSurface, Error, SurfaceChannel, SurfaceIdentity, SurfaceLink, TargetHost,
};
use tabchat_protocol::{
	NavigateData, SurfaceCommand, SurfaceFrame, SurfaceHello, SurfaceInbound, SurfaceReply,
	parse_surface_inbound,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// One connected surface instance.
pub struct SurfaceConn {
	id: u64,
	hello: SurfaceHello,
	tx: mpsc::UnboundedSender<Message>,
	pending: DashMap<u64, oneshot::Sender<Result<Value, String>>>,
	next_id: AtomicU64,
}

impl SurfaceConn {
	fn new(id: u64, hello: SurfaceHello, tx: mpsc::UnboundedSender<Message>) -> Self {
		Self {
			id,
			hello,
			tx,
			pending: DashMap::new(),
			next_id: AtomicU64::new(0),
		}
	}

	fn label(&self) -> String {
		format!("surface-{}", self.id)
	}

	fn complete(&self, reply: SurfaceReply) {
		if let Some((_, sender)) = self.pending.remove(&reply.id) {
			let result = match reply.error {
				Some(error) => Err(error),
				None => Ok(reply.result.unwrap_or(Value::Null)),
			};
			let _ = sender.send(result);
		} else {
			warn!(
				target = "tabchat.hub",
				id = reply.id,
				"reply with unknown id from surface"
			);
		}
	}

	fn fail_pending(&self, reason: &str) {
		let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
		for id in ids {
			if let Some((_, sender)) = self.pending.remove(&id) {
				let _ = sender.send(Err(reason.to_string()));
			}
		}
	}
}

#[async_trait]
impl SurfaceChannel for SurfaceConn {
	async fn request(
		&self,
		command: SurfaceCommand,
		request_id: Option<String>,
		timeout: Duration,
	) -> Result<Value, String> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, rx) = oneshot::channel();
		self.pending.insert(id, tx);

		let frame = SurfaceFrame {
			id,
			request_id,
			command,
		};
		let text = match serde_json::to_string(&frame) {
			Ok(text) => text,
			Err(err) => {
				self.pending.remove(&id);
				return Err(err.to_string());
			}
		};
		if self.tx.send(Message::Text(text.into())).is_err() {
			self.pending.remove(&id);
			return Err("surface connection closed".to_string());
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err("surface connection closed".to_string()),
			Err(_) => {
				self.pending.remove(&id);
				Err("timed out waiting for surface reply".to_string())
			}
		}
	}
}

/// Registry of connected surfaces; the production [`TargetHost`].
pub struct SurfaceHub {
	connections: DashMap<u64, Arc<SurfaceConn>>,
	next_conn_id: AtomicU64,
	request_timeout: Duration,
}

impl Default for SurfaceHub {
	fn default() -> Self {
		Self::new()
	}
}

impl SurfaceHub {
	pub fn new() -> Self {
		Self {
			connections: DashMap::new(),
			next_conn_id: AtomicU64::new(0),
			request_timeout: Duration::from_secs(30),
		}
	}

	fn register(&self, hello: SurfaceHello, tx: mpsc::UnboundedSender<Message>) -> Arc<SurfaceConn> {
		let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
		let conn = Arc::new(SurfaceConn::new(id, hello, tx));
		self.connections.insert(id, conn.clone());
		conn
	}

	fn surface_for(&self, conn: &Arc<SurfaceConn>) -> Arc<dyn AutomationSurface> {
		Arc::new(SurfaceLink::new(
			conn.clone(),
			SurfaceIdentity {
				label: conn.label(),
				url: conn.hello.url.clone(),
			},
		))
	}

	fn find_by_label(&self, label: &str) -> Option<Arc<SurfaceConn>> {
		self.connections
			.iter()
			.find(|entry| entry.value().label() == label)
			.map(|entry| entry.value().clone())
	}
}

#[async_trait]
impl TargetHost for SurfaceHub {
	fn surfaces(&self) -> Vec<Arc<dyn AutomationSurface>> {
		self.connections
			.iter()
			.map(|entry| self.surface_for(entry.value()))
			.collect()
	}

	async fn open(&self, url: &str) -> tabchat::Result<Arc<dyn AutomationSurface>> {
		// Re-point a live connection at the assistant page; the relay never
		// opens windows on its own.
		let Some(conn) = self
			.connections
			.iter()
			.next()
			.map(|entry| entry.value().clone())
		else {
			return Err(Error::NoTargetAvailable);
		};

		conn.request(
			SurfaceCommand::Navigate {
				data: NavigateData {
					url: url.to_string(),
				},
			},
			None,
			self.request_timeout,
		)
		.await
		.map_err(Error::Surface)?;
		Ok(self.surface_for(&conn))
	}

	async fn install(&self, surface: &dyn AutomationSurface) -> tabchat::Result<()> {
		let label = surface.identity().label;
		let conn = self.find_by_label(&label).ok_or(Error::NoTargetAvailable)?;
		conn.request(SurfaceCommand::Install, None, self.request_timeout)
			.await
			.map_err(Error::Surface)?;
		Ok(())
	}
}

pub fn router(hub: Arc<SurfaceHub>) -> Router {
	Router::new()
		.route("/", get(|| async { "OK" }))
		.route(
			"/surface",
			get(
				|ws: WebSocketUpgrade, State(hub): State<Arc<SurfaceHub>>| async move {
					ws.on_upgrade(move |socket| handle_surface_socket(socket, hub))
				},
			),
		)
		.with_state(hub)
}

async fn handle_surface_socket(socket: WebSocket, hub: Arc<SurfaceHub>) {
	let (mut ws_tx, mut ws_rx) = socket.split();

	// First frame must register the surface.
	let hello = loop {
		match ws_rx.next().await {
			Some(Ok(Message::Text(text))) => match parse_surface_inbound(&text) {
				Ok(SurfaceInbound::Hello(hello)) => break hello,
				Ok(_) => {
					warn!(target = "tabchat.hub", "expected hello frame; closing connection");
					return;
				}
				Err(err) => {
					warn!(target = "tabchat.hub", error = %err, "malformed hello frame");
					return;
				}
			},
			Some(Ok(Message::Close(_))) | None => return,
			Some(Ok(_)) => continue,
			Some(Err(err)) => {
				warn!(target = "tabchat.hub", error = %err, "websocket error before hello");
				return;
			}
		}
	};

	let (tx, rx) = mpsc::unbounded_channel();
	let conn = hub.register(hello, tx);
	info!(
		target = "tabchat.hub",
		id = conn.id,
		url = %conn.hello.url,
		"surface connected"
	);

	let mut rx_stream = UnboundedReceiverStream::new(rx);
	let send_task = tokio::spawn(async move {
		while let Some(msg) = rx_stream.next().await {
			if ws_tx.send(msg).await.is_err() {
				break;
			}
		}
	});

	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Text(text)) => match parse_surface_inbound(&text) {
				Ok(SurfaceInbound::Reply(reply)) => conn.complete(reply),
				Ok(SurfaceInbound::Hello(_)) => {
					debug!(target = "tabchat.hub", id = conn.id, "ignoring repeated hello");
				}
				Ok(SurfaceInbound::Unknown(kind)) => {
					warn!(target = "tabchat.hub", kind = %kind, "unknown frame from surface");
				}
				Err(err) => {
					warn!(target = "tabchat.hub", error = %err, "malformed frame from surface");
				}
			},
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(err) => {
				warn!(target = "tabchat.hub", id = conn.id, error = %err, "surface websocket error");
				break;
			}
		}
	}

	hub.connections.remove(&conn.id);
	conn.fail_pending("surface disconnected");
	send_task.abort();
	info!(target = "tabchat.hub", id = conn.id, "surface disconnected");
}
