//! Caller side of a voice call.
//!
//! Places a call over the control channel, streams paced media frames
//! once the callee answers, and hangs up. Usable as a library so tests
//! can drive a full call against an in-process callee.

pub mod call;
pub mod network;
pub mod session;
pub mod stream;

pub use call::{run_call, CallOutcome};
pub use network::MediaSender;
pub use session::{CallerEvent, CallerSession, CallerState, FailureReason};
pub use stream::{chunk_frames, stream_frames, StreamEnd, StreamSummary};
