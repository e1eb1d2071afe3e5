use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("connect failed: {0}")]
	Connect(String),

	/// The session gave up reconnecting, or a send raced a connection loss.
	#[error("transport disconnected")]
	Disconnected,

	#[error("send failed: {0}")]
	Send(String),

	#[error("timeout after {ms}ms waiting for: {condition}")]
	Timeout { ms: u64, condition: String },

	/// A processing flag exists for the request but the owner's record is
	/// gone (evicted or expired) and no result was ever published.
	#[error("owner record missing for request {0}")]
	OwnerDataMissing(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout { .. })
	}
}
