// Protocol types live in the runtime-agnostic core crate
pub use callcore::{error, signaling, state, types};
pub use callcore::{
    CallError, CallId, CallRole, CallSnapshot, CallState, CallTransition, IceCandidate, MediaKind,
    ParticipantId, SdpKind, SessionDescription, SignalingKind, SignalingMessage, StateCause,
};

pub mod calls;
