//! Marker counting and response-container extraction.
//!
//! Both completion detection and extraction run on the same counting
//! discipline: response containers below a minimum content size are
//! placeholders or partial renders, never valid turns, so the Nth valid
//! occurrence, not "the latest", is what belongs to the Nth request.
//!
//! Everything here is a pure function over a markup snapshot, which keeps the
//! page-specific selectors and heuristics testable against fixtures.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tabchat_protocol::RawCapture;
use thiserror::Error;

/// Chrome elements are short; anything longer is treated as content even when
/// it happens to contain a boilerplate phrase.
const CHROME_MAX_LEN: usize = 80;

/// A strategy could not evaluate the page state at all (as opposed to "the
/// marker is not there yet").
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StrategyError(pub String);

/// Page-specific lookup configuration for the monitored assistant page.
#[derive(Debug, Clone)]
pub struct PageProfile {
	/// Containers holding one rendered assistant turn each.
	pub container_selector: String,
	/// Marker that only appears once a turn has finished rendering.
	pub marker_selector: String,
	/// Raw-markup pattern recomputing the same marker count; fallback lookup.
	pub marker_pattern: String,
	/// Containers with less text than this are placeholders, not turns.
	pub min_content_len: usize,
	/// Phrases that dominate footer chrome rather than answers.
	pub boilerplate_phrases: Vec<String>,
	/// Closed set of action-button labels stripped from captures.
	pub action_labels: Vec<String>,
}

impl Default for PageProfile {
	fn default() -> Self {
		Self {
			container_selector: "[data-assistant-response], .assistant-response".to_string(),
			marker_selector: "[data-status=\"complete\"], .response-footer".to_string(),
			marker_pattern: r#"data-status="complete"|class="[^"]*response-footer"#.to_string(),
			min_content_len: 50,
			boilerplate_phrases: vec![
				"AI responses may include mistakes".to_string(),
				"Learn more".to_string(),
				"Show more".to_string(),
				"Show all".to_string(),
			],
			action_labels: vec![
				"Copy".to_string(),
				"Share".to_string(),
				"Retry".to_string(),
				"Report".to_string(),
				"Listen".to_string(),
				"Like".to_string(),
				"Dislike".to_string(),
			],
		}
	}
}

fn parse_selector(raw: &str) -> Result<Selector, StrategyError> {
	Selector::parse(raw).map_err(|err| StrategyError(format!("bad selector {raw:?}: {err}")))
}

fn container_text(element: &ElementRef<'_>) -> String {
	element
		.text()
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.collect::<Vec<_>>()
		.join(" ")
}

/// A container is a valid turn when its chrome-stripped content meets the
/// minimum size; footers and action buttons never make a placeholder valid.
fn is_valid_turn(element: &ElementRef<'_>, profile: &PageProfile) -> bool {
	clean_text(*element, profile).len() >= profile.min_content_len
}

/// Counts completion markers attached to valid response containers.
///
/// Structural lookup; the primary detection strategy.
pub fn count_valid_markers(markup: &str, profile: &PageProfile) -> Result<usize, StrategyError> {
	let doc = Html::parse_document(markup);
	let containers = parse_selector(&profile.container_selector)?;
	let markers = parse_selector(&profile.marker_selector)?;

	Ok(doc
		.select(&containers)
		.filter(|c| is_valid_turn(c, profile))
		.filter(|c| c.select(&markers).next().is_some())
		.count())
}

/// Recomputes the marker count with a raw-markup pattern scan.
///
/// Used only when the structural lookup itself errors; a marker that is
/// merely not present yet is not an error.
pub fn count_markers_by_pattern(markup: &str, profile: &PageProfile) -> Result<usize, StrategyError> {
	let re = Regex::new(&profile.marker_pattern)
		.map_err(|err| StrategyError(format!("bad marker pattern: {err}")))?;
	Ok(re.find_iter(markup).count())
}

/// Locates the `index`-th valid response container and returns its raw markup
/// together with a chrome-stripped plain-text rendering.
pub fn extract_nth(
	markup: &str,
	index: u32,
	profile: &PageProfile,
) -> Result<RawCapture, StrategyError> {
	let doc = Html::parse_document(markup);
	let containers = parse_selector(&profile.container_selector)?;

	let valid: Vec<ElementRef<'_>> = doc
		.select(&containers)
		.filter(|c| is_valid_turn(c, profile))
		.collect();

	let position = index.saturating_sub(1) as usize;
	let target = valid.get(position).ok_or_else(|| {
		StrategyError(format!(
			"response container {index} not found ({} valid containers present)",
			valid.len()
		))
	})?;

	Ok(RawCapture {
		markup: target.html(),
		text: clean_text(*target, profile),
	})
}

/// Plain-text rendering of a container with footer/action chrome removed.
fn clean_text(container: ElementRef<'_>, profile: &PageProfile) -> String {
	let mut parts: Vec<String> = Vec::new();
	collect_text(container, profile, &mut parts);
	parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(element: ElementRef<'_>, profile: &PageProfile, out: &mut Vec<String>) {
	for child in element.children() {
		if let Some(el) = ElementRef::wrap(child) {
			if is_chrome(&container_text(&el), profile) {
				continue;
			}
			collect_text(el, profile, out);
		} else if let Some(text) = child.value().as_text() {
			let trimmed = text.trim();
			if !trimmed.is_empty() {
				out.push(trimmed.to_string());
			}
		}
	}
}

/// Small elements dominated by boilerplate, and action buttons from the fixed
/// label set, are chrome rather than content.
fn is_chrome(text: &str, profile: &PageProfile) -> bool {
	if text.is_empty() || text.len() > CHROME_MAX_LEN {
		return false;
	}
	if profile.action_labels.iter().any(|label| label == text) {
		return true;
	}
	profile
		.boilerplate_phrases
		.iter()
		.any(|phrase| text.contains(phrase.as_str()))
}
