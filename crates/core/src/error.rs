use thiserror::Error;

/// Result type alias for relay-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// No automation target exists and the relay never opens a page it was
	/// not explicitly asked for. Surfaced as a structured needs-target
	/// response, not as a failure.
	#[error("no automation target available")]
	NoTargetAvailable,

	/// Same text resubmitted within the debounce window. Benign; the client
	/// sees an "already in progress" response instead of an error.
	#[error("duplicate submission within debounce window")]
	DuplicateSubmission,

	/// Another turn currently owns the page's input and submit controls.
	#[error("another submission is in flight")]
	SubmissionInFlight,

	/// Input or submit control unusable. Fatal for the turn, never retried.
	#[error("submit failed: {0}")]
	SubmitFailed(String),

	#[error("completion timeout after {ms}ms for response {index}")]
	CompletionTimeout { ms: u64, index: u32 },

	#[error("extraction failed: {0}")]
	ExtractionFailure(String),

	#[error("surface error: {0}")]
	Surface(String),

	#[error(transparent)]
	Transport(#[from] tabchat_relay::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}
