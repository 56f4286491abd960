//! Callbacks towards the UI collaborator.

use async_trait::async_trait;
use callcore::{CallId, CallState, StateCause};
use dashmap::DashMap;
use log::{info, warn};

use super::engine::{MediaTrack, NegotiationError, TrackOrigin};

/// Receives everything the UI needs to render a call.
///
/// The incoming, outgoing and in-call views are all driven from these
/// callbacks; none of them tracks call state on its own.
#[async_trait]
pub trait CallObserver: Send + Sync {
    /// Called with the initial state of a new session (cause
    /// [`StateCause::Created`]) and on every transition after that.
    async fn on_state_changed(&self, call_id: &CallId, state: CallState, cause: &StateCause);

    /// A local track was captured or a remote one arrived.
    async fn on_track(&self, _call_id: &CallId, _origin: TrackOrigin, _track: &MediaTrack) {}

    /// Negotiation went wrong without ending the call; media is likely degraded.
    async fn on_negotiation_error(&self, _call_id: &CallId, _error: &NegotiationError) {}
}

/// Writes every callback to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[async_trait]
impl CallObserver for LoggingObserver {
    async fn on_state_changed(&self, call_id: &CallId, state: CallState, cause: &StateCause) {
        info!("Call {} is now {} ({:?})", call_id, state, cause);
    }

    async fn on_track(&self, call_id: &CallId, origin: TrackOrigin, track: &MediaTrack) {
        info!(
            "Call {}: {:?} {} track {}",
            call_id, origin, track.kind, track.id
        );
    }

    async fn on_negotiation_error(&self, call_id: &CallId, error: &NegotiationError) {
        warn!("Call {}: negotiation error: {}", call_id, error);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedChange {
    pub state: CallState,
    pub cause: StateCause,
}

/// Keeps every callback in memory, per call.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    changes: DashMap<CallId, Vec<ObservedChange>>,
    tracks: DashMap<CallId, Vec<(TrackOrigin, MediaTrack)>>,
    errors: DashMap<CallId, Vec<NegotiationError>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self, call_id: &CallId) -> Vec<ObservedChange> {
        self.changes
            .get(call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn states(&self, call_id: &CallId) -> Vec<CallState> {
        self.changes(call_id)
            .into_iter()
            .map(|change| change.state)
            .collect()
    }

    pub fn tracks(&self, call_id: &CallId) -> Vec<(TrackOrigin, MediaTrack)> {
        self.tracks
            .get(call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn errors(&self, call_id: &CallId) -> Vec<NegotiationError> {
        self.errors
            .get(call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Call ids seen so far, in no particular order.
    pub fn calls(&self) -> Vec<CallId> {
        self.changes.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl CallObserver for RecordingObserver {
    async fn on_state_changed(&self, call_id: &CallId, state: CallState, cause: &StateCause) {
        self.changes
            .entry(call_id.clone())
            .or_default()
            .push(ObservedChange {
                state,
                cause: cause.clone(),
            });
    }

    async fn on_track(&self, call_id: &CallId, origin: TrackOrigin, track: &MediaTrack) {
        self.tracks
            .entry(call_id.clone())
            .or_default()
            .push((origin, track.clone()));
    }

    async fn on_negotiation_error(&self, call_id: &CallId, error: &NegotiationError) {
        self.errors
            .entry(call_id.clone())
            .or_default()
            .push(error.clone());
    }
}
