//! Automation surface capability boundary.
//!
//! The surface is the in-page agent that can type into the assistant's input
//! control, activate submit, and read rendered output. How it locates those
//! controls is its own business; the core depends only on this interface, so
//! tests can substitute fakes and the production implementation can speak
//! whatever wire protocol the deployment uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tabchat_protocol::{
	NavigateData, PageTextResult, SnapshotResult, SurfaceCommand, TurnData,
};

use crate::error::{Error, Result};

/// Default per-command timeout for surface round-trips.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe bound; an unresponsive surface is simply "not reachable".
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Which kind of turn a submission opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
	Start,
	Message,
}

/// One submission handed to the surface.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
	pub request_id: String,
	pub conversation_id: String,
	pub text: String,
	/// 1-based ordinal of this turn within its conversation.
	pub index: u32,
	pub kind: TurnKind,
}

/// Identity of a reachable surface instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceIdentity {
	pub label: String,
	pub url: String,
}

/// In-page agent capable of submitting input and reading rendered output.
#[async_trait]
pub trait AutomationSurface: Send + Sync {
	fn identity(&self) -> SurfaceIdentity;

	/// Liveness probe with a short internal timeout.
	async fn probe(&self) -> bool;

	/// Types the text into the page's input control and activates submit.
	async fn submit(&self, turn: &TurnRequest) -> Result<()>;

	/// Markup snapshot of the rendered conversation region.
	async fn snapshot(&self) -> Result<String>;

	/// Whole-page plain text, used for degraded captures.
	async fn page_text(&self) -> Result<String>;

	async fn navigate(&self, url: &str) -> Result<()>;
}

/// Raw frame channel to one connected surface instance.
///
/// Implementations correlate commands to replies and enforce the timeout;
/// errors carry the page agent's message verbatim.
#[async_trait]
pub trait SurfaceChannel: Send + Sync {
	async fn request(
		&self,
		command: SurfaceCommand,
		request_id: Option<String>,
		timeout: Duration,
	) -> std::result::Result<Value, String>;
}

/// Production [`AutomationSurface`] speaking the tab wire protocol over a
/// [`SurfaceChannel`].
pub struct SurfaceLink {
	channel: Arc<dyn SurfaceChannel>,
	identity: SurfaceIdentity,
	request_timeout: Duration,
	probe_timeout: Duration,
}

impl SurfaceLink {
	pub fn new(channel: Arc<dyn SurfaceChannel>, identity: SurfaceIdentity) -> Self {
		Self {
			channel,
			identity,
			request_timeout: REQUEST_TIMEOUT,
			probe_timeout: PROBE_TIMEOUT,
		}
	}

	async fn call(&self, command: SurfaceCommand, request_id: Option<String>) -> Result<Value> {
		self.channel
			.request(command, request_id, self.request_timeout)
			.await
			.map_err(Error::Surface)
	}
}

#[async_trait]
impl AutomationSurface for SurfaceLink {
	fn identity(&self) -> SurfaceIdentity {
		self.identity.clone()
	}

	async fn probe(&self) -> bool {
		self.channel
			.request(SurfaceCommand::Ping, None, self.probe_timeout)
			.await
			.is_ok()
	}

	async fn submit(&self, turn: &TurnRequest) -> Result<()> {
		let data = TurnData {
			conversation_id: turn.conversation_id.clone(),
			message: turn.text.clone(),
		};
		let command = match turn.kind {
			TurnKind::Start => SurfaceCommand::StartConversation { data },
			TurnKind::Message => SurfaceCommand::SendMessage { data },
		};
		self.channel
			.request(command, Some(turn.request_id.clone()), self.request_timeout)
			.await
			.map_err(Error::SubmitFailed)?;
		Ok(())
	}

	async fn snapshot(&self) -> Result<String> {
		let value = self.call(SurfaceCommand::Snapshot, None).await?;
		let result: SnapshotResult = serde_json::from_value(value)?;
		Ok(result.markup)
	}

	async fn page_text(&self) -> Result<String> {
		let value = self.call(SurfaceCommand::PageText, None).await?;
		let result: PageTextResult = serde_json::from_value(value)?;
		Ok(result.text)
	}

	async fn navigate(&self, url: &str) -> Result<()> {
		self.call(
			SurfaceCommand::Navigate {
				data: NavigateData {
					url: url.to_string(),
				},
			},
			None,
		)
		.await?;
		Ok(())
	}
}
