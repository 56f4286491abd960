//! Signaling messages exchanged over the relay.
//!
//! Every message is JSON of the form `{"event": "<name>", "data": {...}}` with
//! camelCase fields. Event names match the chat server's socket events
//! (`call/answer`, `webrtc/ice-candidate`, ...). Session descriptions and
//! candidates are opaque to this crate: they are produced and consumed by the
//! negotiation engine and only relayed here.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CallError;
use crate::types::{CallId, MediaKind, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer produced by the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host"
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

/// A signaling message, tagged by its socket event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Announces a new call. Carries no negotiation data.
    #[serde(rename = "call/offer-initiate")]
    OfferInitiate {
        call_id: CallId,
        caller_id: ParticipantId,
        callee_id: ParticipantId,
        media_kind: MediaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// The callee's decision.
    #[serde(rename = "call/answer")]
    Answer { call_id: CallId, accepted: bool },

    /// Either side hung up.
    #[serde(rename = "call/end")]
    End { call_id: CallId },

    #[serde(rename = "webrtc/offer")]
    SdpOffer {
        call_id: CallId,
        sdp: SessionDescription,
    },

    #[serde(rename = "webrtc/answer")]
    SdpAnswer {
        call_id: CallId,
        sdp: SessionDescription,
    },

    #[serde(rename = "webrtc/ice-candidate")]
    Candidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::OfferInitiate { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::End { call_id }
            | Self::SdpOffer { call_id, .. }
            | Self::SdpAnswer { call_id, .. }
            | Self::Candidate { call_id, .. } => call_id,
        }
    }

    pub fn kind(&self) -> SignalingKind {
        match self {
            Self::OfferInitiate { .. } => SignalingKind::OfferInitiate,
            Self::Answer { .. } => SignalingKind::Answer,
            Self::End { .. } => SignalingKind::End,
            Self::SdpOffer { .. } => SignalingKind::SdpOffer,
            Self::SdpAnswer { .. } => SignalingKind::SdpAnswer,
            Self::Candidate { .. } => SignalingKind::Candidate,
        }
    }

    pub fn to_json(&self) -> Result<String, CallError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CallError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// The event names of [`SignalingMessage`], without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingKind {
    OfferInitiate,
    Answer,
    End,
    SdpOffer,
    SdpAnswer,
    Candidate,
}

impl SignalingKind {
    pub const ALL: [SignalingKind; 6] = [
        Self::OfferInitiate,
        Self::Answer,
        Self::End,
        Self::SdpOffer,
        Self::SdpAnswer,
        Self::Candidate,
    ];

    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::OfferInitiate => "call/offer-initiate",
            Self::Answer => "call/answer",
            Self::End => "call/end",
            Self::SdpOffer => "webrtc/offer",
            Self::SdpAnswer => "webrtc/answer",
            Self::Candidate => "webrtc/ice-candidate",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }

    /// Messages that carry negotiation artifacts rather than call control.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::SdpOffer | Self::SdpAnswer | Self::Candidate)
    }
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}
