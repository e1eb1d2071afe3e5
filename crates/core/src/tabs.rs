//! Tab lifecycle: ensuring exactly one reachable automation target.
//!
//! Adoption is always preferred over creation, and the relay never opens a
//! page it was not explicitly asked for: when no target has ever existed the
//! caller gets a typed [`Target::NeedsTarget`] outcome to surface to the
//! client, not an error and not a surprise tab.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::detector::{PollConfig, poll_until};
use crate::error::{Error, Result};
use crate::surface::AutomationSurface;

/// The single page the relay controls; (re)creation and end-of-conversation
/// resets navigate here and nowhere else.
pub const DEFAULT_ASSISTANT_URL: &str = "https://www.google.com/search?udm=50";

/// Host capability for finding, creating, and re-installing automation
/// targets.
#[async_trait]
pub trait TargetHost: Send + Sync {
	/// Surfaces currently reachable through this host.
	fn surfaces(&self) -> Vec<Arc<dyn AutomationSurface>>;

	/// Opens (or re-points) a target at `url`. The surface inside it may need
	/// time to become ready.
	async fn open(&self, url: &str) -> Result<Arc<dyn AutomationSurface>>;

	/// Re-installs the automation surface into an unresponsive target.
	async fn install(&self, surface: &dyn AutomationSurface) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TabConfig {
	pub assistant_url: String,
	/// Cadence of liveness probing while waiting for a recreated target.
	pub ready_poll_interval: Duration,
	/// Bound on each wait for a recreated target to answer probes.
	pub ready_timeout: Duration,
}

impl Default for TabConfig {
	fn default() -> Self {
		Self {
			assistant_url: DEFAULT_ASSISTANT_URL.to_string(),
			ready_poll_interval: Duration::from_millis(500),
			ready_timeout: Duration::from_secs(10),
		}
	}
}

/// Outcome of [`TabLifecycle::ensure_target`].
pub enum Target {
	Ready(Arc<dyn AutomationSurface>),
	/// No target was ever adopted; manual creation by the user is required.
	NeedsTarget,
}

impl std::fmt::Debug for Target {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Target::Ready(_) => f.write_str("Target::Ready(..)"),
			Target::NeedsTarget => f.write_str("Target::NeedsTarget"),
		}
	}
}

/// Tracks the single addressable target across adoptions and recreations.
pub struct TabLifecycle {
	host: Arc<dyn TargetHost>,
	config: TabConfig,
	remembered: Mutex<Option<Arc<dyn AutomationSurface>>>,
	had_target: AtomicBool,
}

impl TabLifecycle {
	pub fn new(host: Arc<dyn TargetHost>, config: TabConfig) -> Self {
		Self {
			host,
			config,
			remembered: Mutex::new(None),
			had_target: AtomicBool::new(false),
		}
	}

	pub fn assistant_url(&self) -> &str {
		&self.config.assistant_url
	}

	/// The currently remembered surface, without probing or creating.
	pub async fn current(&self) -> Option<Arc<dyn AutomationSurface>> {
		self.remembered.lock().await.clone()
	}

	/// Ensures a reachable automation target and returns its surface.
	///
	/// Order: adopt an existing matching surface, reuse the remembered one,
	/// report needs-target when none was ever created, otherwise recreate and
	/// wait for the surface to come up (with a single re-install attempt).
	pub async fn ensure_target(&self) -> Result<Target> {
		let mut remembered = self.remembered.lock().await;

		for surface in self.host.surfaces() {
			let identity = surface.identity();
			if !page_matches(&identity.url, &self.config.assistant_url) {
				continue;
			}
			if surface.probe().await {
				debug!(
					target = "tabchat.tabs",
					label = %identity.label,
					url = %identity.url,
					"adopted existing automation target"
				);
				*remembered = Some(surface.clone());
				self.had_target.store(true, Ordering::SeqCst);
				return Ok(Target::Ready(surface));
			}
		}

		if let Some(surface) = remembered.as_ref() {
			if surface.probe().await {
				return Ok(Target::Ready(surface.clone()));
			}
			debug!(target = "tabchat.tabs", "remembered target no longer answers probes");
		}

		if !self.had_target.load(Ordering::SeqCst) {
			return Ok(Target::NeedsTarget);
		}

		info!(target = "tabchat.tabs", url = %self.config.assistant_url, "recreating automation target");
		let surface = self
			.host
			.open(&self.config.assistant_url)
			.await
			.map_err(|err| {
				warn!(target = "tabchat.tabs", error = %err, "target recreation failed");
				Error::NoTargetAvailable
			})?;

		if self.await_ready(surface.as_ref()).await {
			*remembered = Some(surface.clone());
			return Ok(Target::Ready(surface));
		}

		// One re-install attempt before giving up on the recreated target.
		info!(target = "tabchat.tabs", "surface unresponsive; re-installing");
		self.host.install(surface.as_ref()).await.map_err(|err| {
			warn!(target = "tabchat.tabs", error = %err, "surface re-install failed");
			Error::NoTargetAvailable
		})?;

		if self.await_ready(surface.as_ref()).await {
			*remembered = Some(surface.clone());
			return Ok(Target::Ready(surface));
		}

		Err(Error::NoTargetAvailable)
	}

	async fn await_ready(&self, surface: &dyn AutomationSurface) -> bool {
		let config = PollConfig::new(self.config.ready_poll_interval, self.config.ready_timeout);
		poll_until(&config, move || async move {
			Ok::<_, std::convert::Infallible>(surface.probe().await)
		})
		.await
	}
}

/// Compares page identity ignoring query and fragment.
fn page_matches(url: &str, assistant_url: &str) -> bool {
	base_of(url) == base_of(assistant_url)
}

fn base_of(url: &str) -> &str {
	let end = url.find(['?', '#']).unwrap_or(url.len());
	url[..end].trim_end_matches('/')
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicU32;

	use parking_lot::Mutex as PlMutex;

	use super::*;
	use crate::surface::{SurfaceIdentity, TurnRequest};

	struct FakeSurface {
		url: String,
		alive: AtomicBool,
	}

	impl FakeSurface {
		fn new(url: &str, alive: bool) -> Arc<Self> {
			Arc::new(Self {
				url: url.to_string(),
				alive: AtomicBool::new(alive),
			})
		}
	}

	#[async_trait]
	impl AutomationSurface for FakeSurface {
		fn identity(&self) -> SurfaceIdentity {
			SurfaceIdentity {
				label: "fake".to_string(),
				url: self.url.clone(),
			}
		}
		async fn probe(&self) -> bool {
			self.alive.load(Ordering::SeqCst)
		}
		async fn submit(&self, _turn: &TurnRequest) -> Result<()> {
			Ok(())
		}
		async fn snapshot(&self) -> Result<String> {
			Ok(String::new())
		}
		async fn page_text(&self) -> Result<String> {
			Ok(String::new())
		}
		async fn navigate(&self, _url: &str) -> Result<()> {
			Ok(())
		}
	}

	#[derive(Default)]
	struct FakeHost {
		listed: PlMutex<Vec<Arc<dyn AutomationSurface>>>,
		opened: PlMutex<Vec<Arc<dyn AutomationSurface>>>,
		open_calls: AtomicU32,
		install_calls: AtomicU32,
	}

	#[async_trait]
	impl TargetHost for FakeHost {
		fn surfaces(&self) -> Vec<Arc<dyn AutomationSurface>> {
			self.listed.lock().clone()
		}
		async fn open(&self, _url: &str) -> Result<Arc<dyn AutomationSurface>> {
			self.open_calls.fetch_add(1, Ordering::SeqCst);
			self.opened
				.lock()
				.first()
				.cloned()
				.ok_or(Error::NoTargetAvailable)
		}
		async fn install(&self, _surface: &dyn AutomationSurface) -> Result<()> {
			self.install_calls.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	const ASSISTANT: &str = "https://www.google.com/search?udm=50";

	fn lifecycle(host: Arc<FakeHost>) -> TabLifecycle {
		let config = TabConfig {
			assistant_url: ASSISTANT.to_string(),
			ready_poll_interval: Duration::from_millis(500),
			ready_timeout: Duration::from_secs(2),
		};
		TabLifecycle::new(host, config)
	}

	#[test]
	fn page_identity_ignores_query_and_trailing_slash() {
		assert!(page_matches(
			"https://www.google.com/search?udm=50&q=hello",
			ASSISTANT
		));
		assert!(page_matches("https://www.google.com/search/", ASSISTANT));
		assert!(!page_matches("https://www.google.com/maps", ASSISTANT));
		assert!(!page_matches("https://example.com/search", ASSISTANT));
	}

	#[tokio::test]
	async fn adopts_matching_live_surface() {
		let host = Arc::new(FakeHost::default());
		host.listed.lock().push(FakeSurface::new(
			"https://www.google.com/search?udm=50&q=x",
			true,
		));

		let tabs = lifecycle(host.clone());
		let target = tabs.ensure_target().await.unwrap();
		assert!(matches!(target, Target::Ready(_)));
		assert!(tabs.current().await.is_some());
		assert_eq!(host.open_calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn non_matching_surface_is_not_adopted() {
		let host = Arc::new(FakeHost::default());
		host.listed
			.lock()
			.push(FakeSurface::new("https://example.com/other", true));

		let tabs = lifecycle(host);
		assert!(matches!(
			tabs.ensure_target().await.unwrap(),
			Target::NeedsTarget
		));
	}

	#[tokio::test]
	async fn never_created_reports_needs_target() {
		let tabs = lifecycle(Arc::new(FakeHost::default()));
		assert!(matches!(
			tabs.ensure_target().await.unwrap(),
			Target::NeedsTarget
		));
	}

	#[tokio::test]
	async fn dead_target_is_recreated() {
		let host = Arc::new(FakeHost::default());
		let original = FakeSurface::new(ASSISTANT, true);
		host.listed.lock().push(original.clone());

		let tabs = lifecycle(host.clone());
		assert!(matches!(
			tabs.ensure_target().await.unwrap(),
			Target::Ready(_)
		));

		// target dies and disappears from the host's listing
		original.alive.store(false, Ordering::SeqCst);
		host.listed.lock().clear();
		host.opened.lock().push(FakeSurface::new(ASSISTANT, true));

		assert!(matches!(
			tabs.ensure_target().await.unwrap(),
			Target::Ready(_)
		));
		assert_eq!(host.open_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn unresponsive_recreation_installs_once_then_fails() {
		let host = Arc::new(FakeHost::default());
		let original = FakeSurface::new(ASSISTANT, true);
		host.listed.lock().push(original.clone());

		let tabs = lifecycle(host.clone());
		tabs.ensure_target().await.unwrap();

		original.alive.store(false, Ordering::SeqCst);
		host.listed.lock().clear();
		host.opened.lock().push(FakeSurface::new(ASSISTANT, false));

		let err = tabs.ensure_target().await.unwrap_err();
		assert!(matches!(err, Error::NoTargetAvailable));
		assert_eq!(host.install_calls.load(Ordering::SeqCst), 1);
	}
}
