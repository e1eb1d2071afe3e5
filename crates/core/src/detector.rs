//! Bounded polling and completion detection.
//!
//! Completion of a turn is detected by counting page-level completion markers
//! and comparing the count of valid markers reached to the turn's response
//! index, never by watching "the latest" output. The polling loop tolerates
//! predicate evaluation failures (transient DOM states during rendering are
//! expected) and resolves to a plain boolean; the caller decides whether a
//! timeout is fatal.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace};

use crate::capture::{self, PageProfile, StrategyError};
use crate::surface::AutomationSurface;

/// Poll cadence for completion checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall completion timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard ceiling no configuration can exceed.
pub const TIMEOUT_CEILING: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct PollConfig {
	pub interval: Duration,
	pub timeout: Duration,
}

impl PollConfig {
	pub fn new(interval: Duration, timeout: Duration) -> Self {
		Self { interval, timeout }
	}
}

/// Polls `predicate` until it reports true or the timeout elapses.
///
/// Returns whether the predicate succeeded; never errors on timeout.
/// Evaluation failures count as "not yet".
pub async fn poll_until<F, Fut, E>(config: &PollConfig, mut predicate: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = std::result::Result<bool, E>>,
	E: Display,
{
	let deadline = tokio::time::Instant::now() + config.timeout;
	loop {
		match predicate().await {
			Ok(true) => return true,
			Ok(false) => {}
			Err(err) => {
				trace!(
					target = "tabchat.detector",
					error = %err,
					"predicate evaluation failed; treating as not complete"
				);
			}
		}

		let now = tokio::time::Instant::now();
		if now >= deadline {
			return false;
		}
		tokio::time::sleep(config.interval.min(deadline - now)).await;
	}
}

/// A detection strategy: a pure function from observable page markup to the
/// number of valid completion markers it can see.
pub trait MarkerStrategy: Send + Sync {
	fn name(&self) -> &'static str;
	fn count(&self, markup: &str, profile: &PageProfile) -> Result<usize, StrategyError>;
}

/// Primary strategy: structural lookup via the profile's selectors.
pub struct SelectorStrategy;

impl MarkerStrategy for SelectorStrategy {
	fn name(&self) -> &'static str {
		"selector"
	}

	fn count(&self, markup: &str, profile: &PageProfile) -> Result<usize, StrategyError> {
		capture::count_valid_markers(markup, profile)
	}
}

/// Fallback strategy: raw-markup pattern scan. Consulted only when an earlier
/// strategy errors, not when it merely reports "not found yet".
pub struct PatternStrategy;

impl MarkerStrategy for PatternStrategy {
	fn name(&self) -> &'static str {
		"pattern"
	}

	fn count(&self, markup: &str, profile: &PageProfile) -> Result<usize, StrategyError> {
		capture::count_markers_by_pattern(markup, profile)
	}
}

/// Detects when the Nth turn of a conversation has finished rendering.
pub struct CompletionDetector {
	profile: PageProfile,
	strategies: Vec<Box<dyn MarkerStrategy>>,
	config: PollConfig,
}

impl CompletionDetector {
	pub fn new(profile: PageProfile, timeout: Duration) -> Self {
		Self::with_strategies(
			profile,
			timeout,
			vec![Box::new(SelectorStrategy), Box::new(PatternStrategy)],
		)
	}

	pub fn with_strategies(
		profile: PageProfile,
		timeout: Duration,
		strategies: Vec<Box<dyn MarkerStrategy>>,
	) -> Self {
		Self {
			profile,
			strategies,
			config: PollConfig::new(POLL_INTERVAL, timeout.min(TIMEOUT_CEILING)),
		}
	}

	pub fn timeout(&self) -> Duration {
		self.config.timeout
	}

	/// True once at least `index` turns have finished rendering.
	///
	/// Counting makes completion monotonic per conversation: the predicate
	/// cannot hold for index `k` before it held for `k - 1`.
	pub fn is_complete(&self, markup: &str, index: u32) -> Result<bool, StrategyError> {
		let mut last_err = None;
		for strategy in &self.strategies {
			match strategy.count(markup, &self.profile) {
				Ok(count) => return Ok(count as u32 >= index),
				Err(err) => {
					debug!(
						target = "tabchat.detector",
						strategy = strategy.name(),
						error = %err,
						"detection strategy failed; trying next"
					);
					last_err = Some(err);
				}
			}
		}
		Err(last_err
			.unwrap_or_else(|| StrategyError("no detection strategies configured".to_string())))
	}

	/// Polls the surface until the `index`-th completion marker appears or
	/// the timeout elapses.
	pub async fn wait_complete(&self, surface: &dyn AutomationSurface, index: u32) -> bool {
		let detector = self;
		poll_until(&self.config, move || async move {
			let markup = surface.snapshot().await.map_err(|err| err.to_string())?;
			detector
				.is_complete(&markup, index)
				.map_err(|err| err.to_string())
		})
		.await
	}
}
