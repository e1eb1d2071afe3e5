//! Conversation registry and response-index assignment.

use dashmap::DashMap;
use tabchat_relay::now_ms;

/// Per-conversation state. `response_count` only ever grows; an index once
/// assigned is never reused, even when its turn later times out.
#[derive(Debug, Clone)]
pub struct Conversation {
	pub response_count: u32,
	pub created_at: u64,
}

/// In-memory conversation registry. Created on first reference, destroyed
/// only by explicit end or process teardown.
#[derive(Default)]
pub struct Conversations {
	map: DashMap<String, Conversation>,
}

impl Conversations {
	pub fn new() -> Self {
		Self::default()
	}

	/// Accepts a turn: creates the conversation on first reference and
	/// returns the 1-based index assigned to this turn.
	pub fn next_index(&self, conversation_id: &str) -> u32 {
		let mut entry = self
			.map
			.entry(conversation_id.to_string())
			.or_insert_with(|| Conversation {
				response_count: 0,
				created_at: now_ms(),
			});
		entry.response_count += 1;
		entry.response_count
	}

	pub fn response_count(&self, conversation_id: &str) -> u32 {
		self.map
			.get(conversation_id)
			.map(|c| c.response_count)
			.unwrap_or(0)
	}

	/// Ends a conversation; returns whether it existed.
	pub fn end(&self, conversation_id: &str) -> bool {
		self.map.remove(conversation_id).is_some()
	}

	pub fn active(&self) -> usize {
		self.map.len()
	}
}
