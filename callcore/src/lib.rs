//! Runtime-agnostic building blocks of call signaling.
//!
//! Everything in this crate is plain data plus pure functions: identifiers,
//! the call state machine table, and the signaling messages exchanged over the
//! relay. The async session runtime lives in the `chatcall` crate.

pub mod error;
pub mod signaling;
pub mod state;
pub mod types;

pub use error::CallError;
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SignalingKind, SignalingMessage};
pub use state::{CallSnapshot, CallState, CallTransition, InvalidTransition, StateCause};
pub use types::{CallId, CallRole, MediaKind, ParticipantId};
