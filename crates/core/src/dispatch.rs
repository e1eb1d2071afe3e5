//! Envelope dispatch: dedup gating, turn execution, response correlation.
//!
//! Every inbound envelope that carries a request id resolves to exactly one
//! outbound envelope, a response or a structured error, no matter which
//! path it takes. Failures local to one turn never touch the transport
//! session or the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tabchat_protocol::{
	ClientEnvelope, EndData, RawCapture, Response, ResponseData, ServerEnvelope, TurnData,
};
use tabchat_relay::{DedupGate, Role, now_ms};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::{self, PageProfile};
use crate::conversation::Conversations;
use crate::detector::{CompletionDetector, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::surface::{AutomationSurface, TurnKind, TurnRequest};
use crate::tabs::{TabLifecycle, Target};

/// Duplicate-send protection: the same text resubmitted within this window is
/// rejected before any page interaction.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub completion_timeout: Duration,
	pub debounce_window: Duration,
	pub profile: PageProfile,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			completion_timeout: DEFAULT_TIMEOUT,
			debounce_window: DEBOUNCE_WINDOW,
			profile: PageProfile::default(),
		}
	}
}

enum TurnOutcome {
	Completed(Response),
	NeedsTarget,
	TimedOut {
		index: u32,
		elapsed_ms: u64,
		partial: Option<String>,
	},
}

/// Routes client envelopes through the dedup gate to the automation surface
/// and correlates results back to the issuing request.
pub struct Dispatcher {
	conversations: Conversations,
	dedup: Arc<DedupGate>,
	tabs: TabLifecycle,
	detector: CompletionDetector,
	profile: PageProfile,
	outbound: mpsc::UnboundedSender<ServerEnvelope>,
	/// Guards the page's input/submit controls: one physical submission at a
	/// time, later arrivals rejected rather than queued.
	in_flight: tokio::sync::Mutex<()>,
	last_submission: parking_lot::Mutex<Option<(String, Instant)>>,
	debounce_window: Duration,
	message_seq: AtomicU64,
}

impl Dispatcher {
	pub fn new(
		tabs: TabLifecycle,
		dedup: Arc<DedupGate>,
		outbound: mpsc::UnboundedSender<ServerEnvelope>,
		config: DispatcherConfig,
	) -> Self {
		Self {
			conversations: Conversations::new(),
			dedup,
			tabs,
			detector: CompletionDetector::new(config.profile.clone(), config.completion_timeout),
			profile: config.profile,
			outbound,
			in_flight: tokio::sync::Mutex::new(()),
			last_submission: parking_lot::Mutex::new(None),
			debounce_window: config.debounce_window,
			message_seq: AtomicU64::new(0),
		}
	}

	/// Handles one inbound envelope to completion.
	pub async fn handle(&self, envelope: ClientEnvelope) {
		match envelope {
			ClientEnvelope::ConnectionEstablished { connection_id } => {
				info!(
					target = "tabchat.dispatch",
					connection_id = %connection_id,
					"client connection established"
				);
			}
			ClientEnvelope::ConversationStart { request_id, data } => {
				self.turn(request_id, data, TurnKind::Start).await;
			}
			ClientEnvelope::ConversationMessage { request_id, data } => {
				self.turn(request_id, data, TurnKind::Message).await;
			}
			ClientEnvelope::EndConversation { request_id, data } => {
				self.end(request_id, data).await;
			}
		}
	}

	async fn turn(&self, request_id: String, data: TurnData, kind: TurnKind) {
		match self.dedup.claim(&request_id) {
			Ok(Role::Owner) => self.owner_turn(&request_id, &data, kind).await,
			Ok(Role::Follower) => self.follow(&request_id, &data.conversation_id).await,
			Err(err) => {
				warn!(target = "tabchat.dispatch", request_id = %request_id, error = %err, "dedup claim failed");
				self.send_error(&request_id, self.error_data(&data.conversation_id, &err.to_string()));
			}
		}
	}

	async fn owner_turn(&self, request_id: &str, data: &TurnData, kind: TurnKind) {
		match self.run_turn(request_id, data, kind).await {
			Ok(TurnOutcome::Completed(response)) => {
				match self.dedup.publish(request_id, response.clone()) {
					Ok(_) => self.dedup.schedule_cleanup(request_id.to_string()),
					Err(err) => {
						warn!(target = "tabchat.dispatch", request_id, error = %err, "failed to publish result");
					}
				}
				self.send_response(request_id, response.into_data());
			}
			Ok(TurnOutcome::NeedsTarget) => {
				self.abandon(request_id);
				let mut payload = self.base_data(&data.conversation_id);
				payload.needs_target = Some(true);
				payload.content = Some(
					"No assistant tab is available. Open the assistant page and try again."
						.to_string(),
				);
				self.send_response(request_id, payload);
			}
			Ok(TurnOutcome::TimedOut {
				index,
				elapsed_ms,
				partial,
			}) => {
				self.abandon(request_id);
				let mut payload = self.base_data(&data.conversation_id);
				payload.response_index = Some(index);
				payload.error = Some(
					Error::CompletionTimeout {
						ms: elapsed_ms,
						index,
					}
					.to_string(),
				);
				if let Some(partial) = partial {
					payload.content = Some(partial);
					payload.degraded = Some(true);
				}
				self.send_error(request_id, payload);
			}
			Err(Error::DuplicateSubmission) => {
				self.abandon(request_id);
				// The client's own retry; benign, not an error.
				let mut payload = self.base_data(&data.conversation_id);
				payload.content =
					Some("A submission with this text is already in progress.".to_string());
				self.send_response(request_id, payload);
			}
			Err(err) => {
				self.abandon(request_id);
				warn!(target = "tabchat.dispatch", request_id, error = %err, "turn failed");
				self.send_error(request_id, self.error_data(&data.conversation_id, &err.to_string()));
			}
		}
	}

	async fn follow(&self, request_id: &str, conversation_id: &str) {
		match self.dedup.await_result(request_id).await {
			Ok(record) => self.send_response(request_id, record.response.into_data()),
			Err(err) => {
				self.send_error(request_id, self.error_data(conversation_id, &err.to_string()));
			}
		}
	}

	async fn run_turn(
		&self,
		request_id: &str,
		data: &TurnData,
		kind: TurnKind,
	) -> Result<TurnOutcome> {
		let surface = match self.tabs.ensure_target().await? {
			Target::Ready(surface) => surface,
			Target::NeedsTarget => return Ok(TurnOutcome::NeedsTarget),
		};

		{
			let last = self.last_submission.lock();
			if let Some((text, at)) = last.as_ref() {
				if *text == data.message && at.elapsed() < self.debounce_window {
					return Err(Error::DuplicateSubmission);
				}
			}
		}

		let Ok(_guard) = self.in_flight.try_lock() else {
			return Err(Error::SubmissionInFlight);
		};

		// Index assignment and submission happen back to back under the
		// guard, so indices follow actual submission order.
		let index = self.conversations.next_index(&data.conversation_id);
		*self.last_submission.lock() = Some((data.message.clone(), Instant::now()));

		let turn = TurnRequest {
			request_id: request_id.to_string(),
			conversation_id: data.conversation_id.clone(),
			text: data.message.clone(),
			index,
			kind,
		};
		surface.submit(&turn).await?;

		let started = Instant::now();
		if !self.detector.wait_complete(surface.as_ref(), index).await {
			// The index stays consumed; rolling it back would misalign every
			// later turn of this conversation.
			let partial = surface.page_text().await.ok().filter(|t| !t.is_empty());
			return Ok(TurnOutcome::TimedOut {
				index,
				elapsed_ms: started.elapsed().as_millis() as u64,
				partial,
			});
		}

		let (capture, degraded) = match self.extract(surface.as_ref(), index).await {
			Ok(capture) => (capture, false),
			Err(err) => {
				warn!(
					target = "tabchat.dispatch",
					request_id,
					index,
					error = %err,
					"extraction failed; falling back to whole-page text"
				);
				let text = surface.page_text().await?;
				(
					RawCapture {
						markup: String::new(),
						text,
					},
					true,
				)
			}
		};

		Ok(TurnOutcome::Completed(Response {
			conversation_id: data.conversation_id.clone(),
			message_id: self.next_message_id(),
			content: capture.text.clone(),
			raw_capture: Some(capture),
			completion_time: now_ms(),
			response_index: index,
			degraded,
		}))
	}

	async fn extract(&self, surface: &dyn AutomationSurface, index: u32) -> Result<RawCapture> {
		let markup = surface.snapshot().await?;
		capture::extract_nth(&markup, index, &self.profile)
			.map_err(|err| Error::ExtractionFailure(err.to_string()))
	}

	async fn end(&self, request_id: String, data: EndData) {
		match self.dedup.claim(&request_id) {
			Ok(Role::Owner) => {
				if let Some(surface) = self.tabs.current().await {
					if let Err(err) = surface.navigate(self.tabs.assistant_url()).await {
						warn!(target = "tabchat.dispatch", error = %err, "failed to reset assistant tab");
					}
				}
				let existed = self.conversations.end(&data.conversation_id);
				let response = Response {
					conversation_id: data.conversation_id.clone(),
					message_id: self.next_message_id(),
					content: if existed {
						"Conversation ended.".to_string()
					} else {
						"No active conversation to end.".to_string()
					},
					raw_capture: None,
					completion_time: now_ms(),
					response_index: 0,
					degraded: false,
				};
				match self.dedup.publish(&request_id, response.clone()) {
					Ok(_) => self.dedup.schedule_cleanup(request_id.clone()),
					Err(err) => {
						warn!(target = "tabchat.dispatch", request_id = %request_id, error = %err, "failed to publish end result");
					}
				}
				self.send_response(&request_id, response.into_data());
			}
			Ok(Role::Follower) => self.follow(&request_id, &data.conversation_id).await,
			Err(err) => {
				self.send_error(&request_id, self.error_data(&data.conversation_id, &err.to_string()));
			}
		}
	}

	fn abandon(&self, request_id: &str) {
		if let Err(err) = self.dedup.release(request_id) {
			warn!(target = "tabchat.dispatch", request_id, error = %err, "failed to release dedup claim");
		}
	}

	fn base_data(&self, conversation_id: &str) -> ResponseData {
		ResponseData {
			conversation_id: conversation_id.to_string(),
			message_id: Some(self.next_message_id()),
			..Default::default()
		}
	}

	fn error_data(&self, conversation_id: &str, message: &str) -> ResponseData {
		let mut data = self.base_data(conversation_id);
		data.error = Some(message.to_string());
		data
	}

	fn next_message_id(&self) -> String {
		let seq = self.message_seq.fetch_add(1, Ordering::Relaxed) + 1;
		format!("msg_{seq}_{}", now_ms())
	}

	fn send_response(&self, request_id: &str, data: ResponseData) {
		self.emit(ServerEnvelope::response(request_id, data));
	}

	fn send_error(&self, request_id: &str, data: ResponseData) {
		self.emit(ServerEnvelope::error(request_id, data));
	}

	fn emit(&self, envelope: ServerEnvelope) {
		if self.outbound.send(envelope).is_err() {
			warn!(target = "tabchat.dispatch", "outbound channel closed; dropping envelope");
		}
	}
}
