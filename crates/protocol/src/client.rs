//! Envelopes exchanged with the external automation client.
//!
//! The inbound side uses the client's own uppercase discriminators; outbound
//! frames use snake_case. Both directions are plain JSON text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation payload carried by start/message envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnData {
	pub conversation_id: String,
	pub message: String,
}

/// Payload of an end-conversation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndData {
	pub conversation_id: String,
}

/// Inbound envelope from the external automation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
	/// Sent by the client once per connection, before any conversation traffic.
	#[serde(rename = "connection_established")]
	ConnectionEstablished { connection_id: String },

	#[serde(rename = "CONVERSATION_START")]
	ConversationStart { request_id: String, data: TurnData },

	#[serde(rename = "CONVERSATION_MESSAGE")]
	ConversationMessage { request_id: String, data: TurnData },

	#[serde(rename = "END_CONVERSATION")]
	EndConversation { request_id: String, data: EndData },
}

impl ClientEnvelope {
	/// Request id carried by the envelope, if the type has one.
	pub fn request_id(&self) -> Option<&str> {
		match self {
			ClientEnvelope::ConnectionEstablished { .. } => None,
			ClientEnvelope::ConversationStart { request_id, .. }
			| ClientEnvelope::ConversationMessage { request_id, .. }
			| ClientEnvelope::EndConversation { request_id, .. } => Some(request_id),
		}
	}
}

/// Outcome of parsing one inbound text frame.
///
/// Unknown discriminators are reported rather than treated as malformed so the
/// session can log and drop them without tearing the connection down.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeParse {
	Envelope(ClientEnvelope),
	Unknown(String),
}

const KNOWN_TYPES: [&str; 4] = [
	"connection_established",
	"CONVERSATION_START",
	"CONVERSATION_MESSAGE",
	"END_CONVERSATION",
];

/// Parses an inbound client frame, distinguishing unknown types from
/// malformed JSON.
pub fn parse_client_envelope(raw: &str) -> serde_json::Result<EnvelopeParse> {
	let value: Value = serde_json::from_str(raw)?;
	let kind = value
		.get("type")
		.and_then(|v| v.as_str())
		.unwrap_or_default()
		.to_string();
	if !KNOWN_TYPES.contains(&kind.as_str()) {
		return Ok(EnvelopeParse::Unknown(kind));
	}
	serde_json::from_value(value).map(EnvelopeParse::Envelope)
}

/// Outbound envelope to the external automation client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
	ConversationResponse { request_id: String, data: ResponseData },
	ConversationError { request_id: String, data: ResponseData },
}

impl ServerEnvelope {
	pub fn response(request_id: impl Into<String>, data: ResponseData) -> Self {
		ServerEnvelope::ConversationResponse {
			request_id: request_id.into(),
			data,
		}
	}

	pub fn error(request_id: impl Into<String>, data: ResponseData) -> Self {
		ServerEnvelope::ConversationError {
			request_id: request_id.into(),
			data,
		}
	}
}

/// Payload of an outbound envelope. Every failure path still produces one of
/// these, so the client's request always resolves to a well-formed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
	pub conversation_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw_capture: Option<RawCapture>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completion_time: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_index: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub needs_target: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub degraded: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Raw page capture for one turn: the container's markup plus the cleaned
/// plain-text rendering. Structured markup conversion happens downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
	pub markup: String,
	pub text: String,
}

/// Result of one completed conversation turn.
///
/// This is what the deduplication layer stores and replays to late observers
/// of the same request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub conversation_id: String,
	pub message_id: String,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw_capture: Option<RawCapture>,
	/// Unix milliseconds at which completion was confirmed.
	pub completion_time: u64,
	pub response_index: u32,
	/// Set when the content came from the whole-page fallback capture.
	#[serde(default)]
	pub degraded: bool,
}

impl Response {
	/// Converts the turn result into an outbound envelope payload.
	pub fn into_data(self) -> ResponseData {
		ResponseData {
			conversation_id: self.conversation_id,
			message_id: Some(self.message_id),
			content: Some(self.content),
			raw_capture: self.raw_capture,
			metadata: None,
			completion_time: Some(self.completion_time),
			response_index: Some(self.response_index),
			needs_target: None,
			degraded: self.degraded.then_some(true),
			error: None,
		}
	}
}
