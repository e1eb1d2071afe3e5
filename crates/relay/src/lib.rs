//! Transport session and request deduplication for the tabchat relay.
//!
//! This crate owns the two pieces that make the relay safe to run alongside
//! uncoordinated copies of itself:
//!
//! - **Session**: the persistent WebSocket connection to the external
//!   automation client, with linear-backoff reconnection and a broadcast
//!   connection status.
//! - **Dedup**: the cross-instance request-deduplication protocol. Several
//!   independently-initialized observers can see the same inbound request;
//!   exactly one becomes the owner and does the work, the rest wait for the
//!   owner's published result.

pub mod dedup;
mod error;
pub mod session;

pub use dedup::{DedupConfig, DedupGate, Role};
pub use dedup::store::{
	FileStore, MemoryStore, ProcessingRecord, ProcessingStatus, RecordStore, ResultRecord, now_ms,
};
pub use error::{Error, Result};
pub use session::{Session, SessionConfig, Status, DEFAULT_ENDPOINT};
