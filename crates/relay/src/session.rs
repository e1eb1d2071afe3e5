//! Persistent transport session to the external automation client.
//!
//! The session dials out to the client's WebSocket endpoint and keeps the
//! connection alive across failures: every loss schedules a reconnect with a
//! linearly increasing delay (`base_delay * attempt`), and after
//! `max_attempts` consecutive failures the session settles into a terminal
//! [`Status::Disconnected`] instead of crashing the process. A successful
//! connect resets the attempt counter.
//!
//! Inbound frames are parsed into [`ClientEnvelope`]s and pushed to the
//! consumer; unknown envelope types are logged and dropped, never fatal.

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tabchat_protocol::{ClientEnvelope, EnvelopeParse, ServerEnvelope, parse_client_envelope};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Well-known local endpoint of the automation client.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8761";

#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// WebSocket endpoint of the automation client.
	pub endpoint: String,
	/// Backoff unit; attempt `n` waits `base_delay * n`.
	pub base_delay: Duration,
	/// Consecutive failed attempts tolerated before giving up.
	pub max_attempts: u32,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self::new(DEFAULT_ENDPOINT)
	}
}

impl SessionConfig {
	pub fn new(endpoint: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			base_delay: Duration::from_secs(1),
			max_attempts: 10,
		}
	}
}

/// Connection status broadcast to local observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
	Connecting,
	Connected {
		/// Id assigned by the client in its `connection_established` frame.
		connection_id: Option<String>,
	},
	/// Terminal: reconnection attempts exhausted.
	Disconnected,
}

impl Status {
	pub fn is_connected(&self) -> bool {
		matches!(self, Status::Connected { .. })
	}
}

/// Handle to a running transport session.
pub struct Session {
	outbound_tx: mpsc::UnboundedSender<ServerEnvelope>,
	status_rx: watch::Receiver<Status>,
	task: JoinHandle<()>,
}

impl Session {
	/// Spawns the session task. Inbound envelopes arrive on the returned
	/// receiver; dropping it shuts the session down.
	pub fn spawn(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<ClientEnvelope>) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (status_tx, status_rx) = watch::channel(Status::Connecting);
		let task = tokio::spawn(run(config, status_tx, inbound_tx, outbound_rx));
		(
			Self {
				outbound_tx,
				status_rx,
				task,
			},
			inbound_rx,
		)
	}

	/// Queues an envelope for delivery. Fails when the session is not
	/// currently connected.
	pub fn send(&self, envelope: ServerEnvelope) -> Result<()> {
		if !self.status_rx.borrow().is_connected() {
			return Err(Error::Disconnected);
		}
		self.outbound_tx
			.send(envelope)
			.map_err(|_| Error::Disconnected)
	}

	/// Status channel for observers (e.g. a status display).
	pub fn status(&self) -> watch::Receiver<Status> {
		self.status_rx.clone()
	}

	pub fn is_connected(&self) -> bool {
		self.status_rx.borrow().is_connected()
	}

	/// Stops the session task immediately.
	pub fn abort(&self) {
		self.task.abort();
	}
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
	base * attempt
}

enum SessionEnd {
	ConnectionLost,
	/// Local consumer went away; shut down instead of reconnecting.
	LocalShutdown,
}

async fn run(
	config: SessionConfig,
	status_tx: watch::Sender<Status>,
	inbound_tx: mpsc::UnboundedSender<ClientEnvelope>,
	mut outbound_rx: mpsc::UnboundedReceiver<ServerEnvelope>,
) {
	let mut attempt: u32 = 0;
	loop {
		status_tx.send_replace(Status::Connecting);
		match connect_and_run(
			&config,
			&status_tx,
			&inbound_tx,
			&mut outbound_rx,
			&mut attempt,
		)
		.await
		{
			Ok(SessionEnd::LocalShutdown) => return,
			Ok(SessionEnd::ConnectionLost) => {
				info!(target = "tabchat.session", "connection lost; scheduling reconnect");
			}
			Err(err) => {
				warn!(target = "tabchat.session", error = %err, "session error");
			}
		}

		attempt += 1;
		if attempt > config.max_attempts {
			warn!(
				target = "tabchat.session",
				attempts = attempt - 1,
				"reconnect attempts exhausted; giving up"
			);
			status_tx.send_replace(Status::Disconnected);
			return;
		}

		let delay = backoff_delay(config.base_delay, attempt);
		debug!(
			target = "tabchat.session",
			attempt,
			delay_ms = delay.as_millis() as u64,
			"waiting before reconnect"
		);
		tokio::time::sleep(delay).await;
	}
}

async fn connect_and_run(
	config: &SessionConfig,
	status_tx: &watch::Sender<Status>,
	inbound_tx: &mpsc::UnboundedSender<ClientEnvelope>,
	outbound_rx: &mut mpsc::UnboundedReceiver<ServerEnvelope>,
	attempt: &mut u32,
) -> Result<SessionEnd> {
	let (ws, _) = connect_async(config.endpoint.as_str())
		.await
		.map_err(|e| Error::Connect(e.to_string()))?;
	info!(target = "tabchat.session", endpoint = %config.endpoint, "connected");
	*attempt = 0;
	status_tx.send_replace(Status::Connected {
		connection_id: None,
	});

	let (mut ws_tx, mut ws_rx) = ws.split();

	loop {
		tokio::select! {
			msg = ws_rx.next() => {
				match msg {
					Some(Ok(Message::Text(text))) => {
						if handle_text(&text, status_tx, inbound_tx).is_break() {
							return Ok(SessionEnd::LocalShutdown);
						}
					}
					Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::ConnectionLost),
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						warn!(target = "tabchat.session", error = %err, "websocket error");
						return Ok(SessionEnd::ConnectionLost);
					}
				}
			}
			envelope = outbound_rx.recv() => {
				let Some(envelope) = envelope else {
					return Ok(SessionEnd::LocalShutdown);
				};
				let text = serde_json::to_string(&envelope)?;
				if let Err(err) = ws_tx.send(Message::Text(text.into())).await {
					warn!(target = "tabchat.session", error = %err, "failed to send envelope");
					return Ok(SessionEnd::ConnectionLost);
				}
			}
		}
	}
}

fn handle_text(
	text: &str,
	status_tx: &watch::Sender<Status>,
	inbound_tx: &mpsc::UnboundedSender<ClientEnvelope>,
) -> ControlFlow<()> {
	match parse_client_envelope(text) {
		Ok(EnvelopeParse::Envelope(envelope)) => {
			if let ClientEnvelope::ConnectionEstablished { connection_id } = &envelope {
				info!(
					target = "tabchat.session",
					connection_id = %connection_id,
					"connection established"
				);
				status_tx.send_replace(Status::Connected {
					connection_id: Some(connection_id.clone()),
				});
			}
			if inbound_tx.send(envelope).is_err() {
				return ControlFlow::Break(());
			}
		}
		Ok(EnvelopeParse::Unknown(kind)) => {
			warn!(target = "tabchat.session", kind = %kind, "dropping envelope with unknown type");
		}
		Err(err) => {
			warn!(target = "tabchat.session", error = %err, "dropping malformed envelope");
		}
	}
	ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
	use tabchat_protocol::ResponseData;
	use tokio::net::TcpListener;
	use tokio_tungstenite::accept_async;

	use super::*;

	fn test_config(endpoint: String) -> SessionConfig {
		SessionConfig {
			endpoint,
			base_delay: Duration::from_millis(10),
			max_attempts: 3,
		}
	}

	#[test]
	fn backoff_increases_linearly() {
		let base = Duration::from_secs(1);
		assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
		assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
		assert_eq!(backoff_delay(base, 5), Duration::from_secs(5));
	}

	#[tokio::test]
	async fn delivers_inbound_and_outbound_envelopes() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = accept_async(stream).await.unwrap();
			ws.send(Message::Text(
				r#"{"type":"connection_established","connection_id":"conn_1"}"#.into(),
			))
			.await
			.unwrap();
			ws.send(Message::Text(
				r#"{"type":"CONVERSATION_START","request_id":"r1","data":{"conversation_id":"c1","message":"hello"}}"#.into(),
			))
			.await
			.unwrap();
			loop {
				match ws.next().await {
					Some(Ok(Message::Text(text))) => return text.to_string(),
					Some(Ok(_)) => continue,
					other => panic!("connection ended early: {other:?}"),
				}
			}
		});

		let (session, mut inbound) = Session::spawn(test_config(format!("ws://{addr}")));

		let first = inbound.recv().await.unwrap();
		assert!(matches!(first, ClientEnvelope::ConnectionEstablished { .. }));
		let second = inbound.recv().await.unwrap();
		assert_eq!(second.request_id(), Some("r1"));
		assert!(session.is_connected());

		session
			.send(ServerEnvelope::response(
				"r1",
				ResponseData {
					conversation_id: "c1".to_string(),
					content: Some("hi".to_string()),
					..Default::default()
				},
			))
			.unwrap();

		let outbound = server.await.unwrap();
		assert!(outbound.contains(r#""type":"conversation_response""#));
		assert!(outbound.contains(r#""request_id":"r1""#));
		session.abort();
	}

	#[tokio::test]
	async fn reconnects_after_connection_loss() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let ws = accept_async(stream).await.unwrap();
			drop(ws);

			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = accept_async(stream).await.unwrap();
			ws.send(Message::Text(
				r#"{"type":"CONVERSATION_MESSAGE","request_id":"r2","data":{"conversation_id":"c1","message":"again"}}"#.into(),
			))
			.await
			.unwrap();
			let _ = ws.next().await;
		});

		let (session, mut inbound) = Session::spawn(test_config(format!("ws://{addr}")));
		let envelope = inbound.recv().await.unwrap();
		assert_eq!(envelope.request_id(), Some("r2"));
		session.abort();
	}

	#[tokio::test]
	async fn gives_up_after_max_attempts() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let (session, _inbound) = Session::spawn(SessionConfig {
			endpoint: format!("ws://{addr}"),
			base_delay: Duration::from_millis(1),
			max_attempts: 2,
		});

		let mut status = session.status();
		loop {
			if *status.borrow_and_update() == Status::Disconnected {
				break;
			}
			if status.changed().await.is_err() {
				break;
			}
		}
		assert_eq!(*status.borrow(), Status::Disconnected);
		assert!(
			session
				.send(ServerEnvelope::error("r1", ResponseData::default()))
				.is_err()
		);
	}
}
