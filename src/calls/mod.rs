//! Call session signaling runtime.
//!
//! Sets up a two-party audio/video call by relaying session descriptions and
//! connectivity candidates between the endpoints, and tracks the call
//! lifecycle through rejection, timeouts and dropped connections.
//!
//! # Architecture
//!
//! - [`CallManager`]: owns the relay subscription and routes every inbound
//!   message to its session by call id
//! - [`CallSessionHandle`]: handle to one call; the session itself runs as a
//!   task that processes one event at a time
//! - [`CandidateQueue`]: holds remote candidates until a remote description exists
//! - [`TimeoutSupervisor`]: the ring deadline
//! - [`NegotiationEngine`]: the external media negotiation capability
//! - [`RelayChannel`]: the outbound half of the message bus
//! - [`CallObserver`]: the UI collaborator, told about every state change
//!
//! # Protocol Overview
//!
//! The caller announces the call with `call/offer-initiate` and waits for
//! `call/answer`. Once accepted, the caller sends `webrtc/offer`, the callee
//! replies with `webrtc/answer`, and both sides trickle
//! `webrtc/ice-candidate` messages. `call/end` or a relay disconnect finish
//! the call.

mod candidates;
mod config;
mod engine;
mod loopback;
mod manager;
mod observer;
mod relay;
mod session;
mod timeout;

pub use candidates::CandidateQueue;
pub use config::{CallManagerConfig, DEFAULT_RING_TIMEOUT, DEFAULT_STUN_SERVER};
pub use engine::{
    EngineConfig, EngineEvent, EngineEvents, MediaTrack, NegotiationEngine,
    NegotiationEngineFactory, NegotiationError, TrackOrigin,
};
pub use loopback::{EngineCall, LoopbackEngine, LoopbackEngineFactory};
pub use manager::CallManager;
pub use observer::{CallObserver, LoggingObserver, ObservedChange, RecordingObserver};
pub use relay::{MemoryRelay, MemoryRelayHub, RelayChannel, RelayEvent, SentMessage};
pub use session::CallSessionHandle;
pub use timeout::TimeoutSupervisor;
