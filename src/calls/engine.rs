//! Interface to the external media negotiation engine.
//!
//! The engine (a WebRTC peer connection in the chat client) does the real work
//! of codec negotiation and network traversal. Sessions only drive it through
//! [`NegotiationEngine`] and relay the artifacts it produces; they never look
//! inside a description or candidate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use callcore::{CallId, IceCandidate, MediaKind, SessionDescription};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("negotiation engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("negotiation engine closed")]
    Closed,
}

/// A media track attached to the call, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrigin {
    Local,
    Remote,
}

/// Things the engine discovers on its own, after the call that triggered them returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// `onicecandidate`: a local candidate to be sent to the peer.
    LocalCandidate(IceCandidate),
    /// `ontrack`: the peer's media arrived.
    RemoteTrack(MediaTrack),
}

/// Where an engine reports its [`EngineEvent`]s.
///
/// For engines created by a session this feeds the session's own event queue,
/// so the events are processed in order with everything else.
#[derive(Clone)]
pub struct EngineEvents {
    sink: Arc<dyn Fn(EngineEvent) -> bool + Send + Sync>,
}

impl EngineEvents {
    pub fn new(sink: impl Fn(EngineEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Returns false once nobody is listening any more.
    pub fn emit(&self, event: EngineEvent) -> bool {
        (self.sink)(event)
    }

    pub fn local_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(EngineEvent::LocalCandidate(candidate))
    }

    pub fn remote_track(&self, track: MediaTrack) -> bool {
        self.emit(EngineEvent::RemoteTrack(track))
    }
}

impl fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEvents").finish_non_exhaustive()
    }
}

/// Settings handed to the factory for each new engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub media_kind: MediaKind,
    pub ice_servers: Vec<String>,
}

/// One negotiation engine instance, owned by exactly one call session.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Capture local media: always audio, plus video for video calls.
    async fn acquire_local_media(
        &self,
        kind: MediaKind,
    ) -> Result<Vec<MediaTrack>, NegotiationError>;

    /// Create an offer and install it as the local description.
    async fn create_local_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer and install it as the local description.
    /// Requires the remote offer to be applied first.
    async fn create_local_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Stop local tracks and close the transport.
    async fn close(&self);
}

/// Creates engines for new sessions.
pub trait NegotiationEngineFactory: Send + Sync {
    fn create(
        &self,
        call_id: &CallId,
        config: &EngineConfig,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}
