//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::types::{CallId, CallRole, MediaKind, ParticipantId};

/// Current state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallState {
    /// Outgoing call: waiting for the callee to answer.
    Calling,
    /// Incoming call: ringing locally.
    Ringing,
    /// Call answered; media negotiation runs inside this state.
    Connected,
    /// Hung up by either side.
    Ended,
    /// Declined by the callee.
    Rejected,
    /// Nobody answered before the deadline.
    NoAnswer,
    /// The relay connection dropped.
    ConnectionLost,
}

impl CallState {
    pub const fn initial(role: CallRole) -> Self {
        match role {
            CallRole::Caller => Self::Calling,
            CallRole::Callee => Self::Ringing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::NoAnswer | Self::ConnectionLost
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::NoAnswer => "noAnswer",
            Self::ConnectionLost => "connectionLost",
        }
    }

    /// Compute the state reached by applying `transition`.
    ///
    /// Only the edges of the call state machine are accepted; everything else,
    /// including any event on a terminal state, is an [`InvalidTransition`].
    pub fn apply(self, transition: &CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState::*;
        use CallTransition as T;

        let next = match (self, transition) {
            (Calling | Ringing, T::RingTimeout) => NoAnswer,
            (Calling, T::RemoteAnswered { accepted: true }) => Connected,
            (Calling, T::RemoteAnswered { accepted: false }) => Rejected,
            (Ringing, T::LocalAnswered { accepted: true }) => Connected,
            (Ringing, T::LocalAnswered { accepted: false }) => Rejected,
            (Calling | Ringing | Connected, T::RemoteEnded) => Ended,
            (Calling | Ringing | Connected, T::Disconnected) => ConnectionLost,
            (Calling | Connected, T::LocalEnded) => Ended,
            (Connected, T::MediaUnavailable(_) | T::NegotiationFailed(_)) => Ended,
            (current, attempted) => {
                return Err(InvalidTransition {
                    current,
                    attempted: attempted.name(),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTransition {
    /// The ring deadline elapsed.
    RingTimeout,
    /// `call/answer` received from the callee.
    RemoteAnswered { accepted: bool },
    /// The local user answered or declined an incoming call.
    LocalAnswered { accepted: bool },
    /// `call/end` received from the peer.
    RemoteEnded,
    /// The local user hung up.
    LocalEnded,
    /// The relay connection was lost.
    Disconnected,
    /// Local camera/microphone could not be acquired.
    MediaUnavailable(String),
    /// The negotiation engine rejected a description.
    NegotiationFailed(String),
}

impl CallTransition {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RingTimeout => "RingTimeout",
            Self::RemoteAnswered { .. } => "RemoteAnswered",
            Self::LocalAnswered { .. } => "LocalAnswered",
            Self::RemoteEnded => "RemoteEnded",
            Self::LocalEnded => "LocalEnded",
            Self::Disconnected => "Disconnected",
            Self::MediaUnavailable(_) => "MediaUnavailable",
            Self::NegotiationFailed(_) => "NegotiationFailed",
        }
    }

    /// The cause reported to observers when this transition is taken.
    pub fn cause(&self) -> StateCause {
        match self {
            Self::RingTimeout => StateCause::NoAnswer,
            Self::RemoteAnswered { accepted: true } => StateCause::RemoteAccepted,
            Self::RemoteAnswered { accepted: false } => StateCause::RemoteDeclined,
            Self::LocalAnswered { accepted: true } => StateCause::LocalAccepted,
            Self::LocalAnswered { accepted: false } => StateCause::LocalDeclined,
            Self::RemoteEnded => StateCause::RemoteHangup,
            Self::LocalEnded => StateCause::LocalHangup,
            Self::Disconnected => StateCause::ConnectionLost,
            Self::MediaUnavailable(detail) => StateCause::MediaUnavailable(detail.clone()),
            Self::NegotiationFailed(detail) => StateCause::NegotiationFailed(detail.clone()),
        }
    }
}

/// Why a session is in its current state. Handed to the UI with every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum StateCause {
    Created,
    RemoteAccepted,
    LocalAccepted,
    RemoteDeclined,
    LocalDeclined,
    NoAnswer,
    RemoteHangup,
    LocalHangup,
    ConnectionLost,
    MediaUnavailable(String),
    NegotiationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallState,
    pub attempted: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Serializable view of one call session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub role: CallRole,
    pub peer_id: ParticipantId,
    pub media_kind: MediaKind,
    pub room_id: Option<String>,
    pub state: CallState,
    pub cause: StateCause,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    pub fn new(
        call_id: CallId,
        role: CallRole,
        peer_id: ParticipantId,
        media_kind: MediaKind,
        room_id: Option<String>,
    ) -> Self {
        Self {
            call_id,
            role,
            peer_id,
            media_kind,
            room_id,
            state: CallState::initial(role),
            cause: StateCause::Created,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    /// Record entry into `state`. The caller is responsible for having validated
    /// the edge with [`CallState::apply`].
    pub fn enter(&mut self, state: CallState, cause: StateCause) {
        let now = Utc::now();
        if state.is_connected() {
            self.connected_at = Some(now);
        }
        if state.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = state;
        self.cause = cause;
    }

    /// Seconds spent connected, once the call has ended.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start).num_seconds()),
            _ => None,
        }
    }
}
