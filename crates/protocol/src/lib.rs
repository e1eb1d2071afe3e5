//! Wire types shared by the tabchat relay, its CLI, and the automation surface.
//!
//! Three message families live here:
//!
//! - **Client envelopes**: the JSON frames exchanged with the external
//!   automation client over the transport session ([`ClientEnvelope`],
//!   [`ServerEnvelope`]).
//! - **Surface frames**: the request/reply frames the relay exchanges with an
//!   automation surface running inside the controlled tab ([`SurfaceFrame`],
//!   [`SurfaceReply`]).
//! - **Results**: the [`Response`] produced for a completed conversation turn,
//!   which is also what the deduplication layer persists and replays.

mod client;
mod surface;

pub use client::{
	ClientEnvelope, EndData, EnvelopeParse, RawCapture, Response, ResponseData, ServerEnvelope,
	TurnData, parse_client_envelope,
};
pub use surface::{
	NavigateData, PageTextResult, PingResult, SnapshotResult, SurfaceCommand, SurfaceFrame,
	SurfaceHello, SurfaceInbound, SurfaceReply, parse_surface_inbound,
};
