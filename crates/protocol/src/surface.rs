//! Frames exchanged between the relay and an automation surface.
//!
//! The surface is the in-page agent that can type into the assistant's input,
//! activate submit, and read rendered output. Commands are correlated to
//! replies by a numeric frame id, independent of the client-level request id
//! that conversation commands also carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::TurnData;

/// Navigation payload for target (re)creation and end-of-conversation reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigateData {
	pub url: String,
}

/// Command sent from the relay to the surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SurfaceCommand {
	/// Liveness probe. A reachable surface answers with [`PingResult`].
	#[serde(rename = "PING")]
	Ping,

	/// Submit the first message of a conversation.
	#[serde(rename = "START_CONVERSATION")]
	StartConversation { data: TurnData },

	/// Submit a follow-up message on an existing conversation.
	#[serde(rename = "SEND_MESSAGE")]
	SendMessage { data: TurnData },

	/// Snapshot of the rendered conversation region's markup.
	#[serde(rename = "SNAPSHOT")]
	Snapshot,

	/// Whole-page plain text, used for degraded captures.
	#[serde(rename = "PAGE_TEXT")]
	PageText,

	#[serde(rename = "NAVIGATE")]
	Navigate { data: NavigateData },

	/// Re-install the automation surface into an unresponsive target.
	#[serde(rename = "INSTALL")]
	Install,
}

/// One command frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceFrame {
	pub id: u64,
	/// Client request id, present on conversation commands so the surface can
	/// keep its own per-request bookkeeping.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
	#[serde(flatten)]
	pub command: SurfaceCommand,
}

/// Reply to a command frame, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceReply {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Registration frame a surface sends right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceHello {
	pub url: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
}

/// Frames a surface may send to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceInbound {
	Hello(SurfaceHello),
	Reply(SurfaceReply),
	Unknown(String),
}

/// Parses one inbound surface frame. Hello frames are tagged
/// `"type": "hello"`; everything else carrying an `id` is a reply.
pub fn parse_surface_inbound(raw: &str) -> serde_json::Result<SurfaceInbound> {
	let value: Value = serde_json::from_str(raw)?;
	if value.get("type").and_then(|v| v.as_str()) == Some("hello") {
		return serde_json::from_value(value).map(SurfaceInbound::Hello);
	}
	if value.get("id").is_some() {
		return serde_json::from_value(value).map(SurfaceInbound::Reply);
	}
	let kind = value
		.get("type")
		.and_then(|v| v.as_str())
		.unwrap_or_default()
		.to_string();
	Ok(SurfaceInbound::Unknown(kind))
}

/// Reply payload of a PING command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
	pub url: String,
	#[serde(default)]
	pub ready: bool,
}

/// Reply payload of a SNAPSHOT command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResult {
	pub markup: String,
}

/// Reply payload of a PAGE_TEXT command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTextResult {
	pub text: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_flattens_command_tag() {
		let frame = SurfaceFrame {
			id: 7,
			request_id: Some("r1".to_string()),
			command: SurfaceCommand::StartConversation {
				data: TurnData {
					conversation_id: "c1".to_string(),
					message: "hello".to_string(),
				},
			},
		};
		let json = serde_json::to_string(&frame).unwrap();
		assert!(json.contains(r#""type":"START_CONVERSATION""#));
		assert!(json.contains(r#""id":7"#));
		let back: SurfaceFrame = serde_json::from_str(&json).unwrap();
		assert_eq!(back, frame);
	}

	#[test]
	fn ping_frame_has_no_request_id() {
		let frame = SurfaceFrame {
			id: 1,
			request_id: None,
			command: SurfaceCommand::Ping,
		};
		let json = serde_json::to_string(&frame).unwrap();
		assert_eq!(json, r#"{"id":1,"type":"PING"}"#);
	}

	#[test]
	fn inbound_hello_and_reply_are_distinguished() {
		let hello = parse_surface_inbound(
			r#"{"type":"hello","url":"https://www.google.com/search?udm=50"}"#,
		)
		.unwrap();
		assert!(matches!(hello, SurfaceInbound::Hello(h) if h.url.contains("udm=50")));

		let reply =
			parse_surface_inbound(r#"{"id":3,"result":{"markup":"<main></main>"}}"#).unwrap();
		let SurfaceInbound::Reply(reply) = reply else {
			panic!("expected reply");
		};
		assert_eq!(reply.id, 3);
		assert!(reply.error.is_none());

		let unknown = parse_surface_inbound(r#"{"type":"status"}"#).unwrap();
		assert_eq!(unknown, SurfaceInbound::Unknown("status".to_string()));
	}

	#[test]
	fn error_reply_round_trip() {
		let reply = SurfaceReply {
			id: 9,
			result: None,
			error: Some("input control not found".to_string()),
		};
		let json = serde_json::to_string(&reply).unwrap();
		assert!(!json.contains("result"));
		let back: SurfaceReply = serde_json::from_str(&json).unwrap();
		assert_eq!(back, reply);
	}
}
