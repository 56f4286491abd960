//! Call manager for orchestrating call lifecycle.

use std::sync::{Arc, Mutex, PoisonError};

use callcore::{
    CallError, CallId, CallRole, CallSnapshot, MediaKind, ParticipantId, SignalingMessage,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::config::CallManagerConfig;
use super::engine::NegotiationEngineFactory;
use super::observer::CallObserver;
use super::relay::{RelayChannel, RelayEvent};
use super::session::{self, CallSessionHandle, NewSession, SessionContext};

/// Fields of a `call/offer-initiate` announcement.
struct IncomingCall {
    call_id: CallId,
    caller_id: ParticipantId,
    callee_id: ParticipantId,
    media_kind: MediaKind,
    room_id: Option<String>,
}

/// One endpoint's calls.
///
/// Owns the inbound relay subscription (see [`CallManager::run`]) and routes
/// each message to its session by call id. Sessions remove themselves once
/// they reach a terminal state.
pub struct CallManager {
    local_id: ParticipantId,
    ctx: SessionContext,
    /// Held while checking the call limit and registering a session.
    admission: Mutex<()>,
}

impl CallManager {
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        engines: Arc<dyn NegotiationEngineFactory>,
        observer: Arc<dyn CallObserver>,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: relay.local_id().clone(),
            ctx: SessionContext {
                relay,
                engines,
                observer,
                config: Arc::new(config),
                registry: Arc::new(DashMap::new()),
            },
            admission: Mutex::new(()),
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.ctx.config
    }

    /// Start an outgoing call.
    ///
    /// The session starts in `Calling` with the ring timer armed, and the
    /// callee is sent `call/offer-initiate`.
    pub async fn start_call(
        &self,
        peer_id: ParticipantId,
        media_kind: MediaKind,
        room_id: Option<String>,
    ) -> Result<CallSessionHandle, CallError> {
        let handle = self.admit(NewSession {
            call_id: CallId::generate(),
            role: CallRole::Caller,
            peer_id: peer_id.clone(),
            media_kind,
            room_id: room_id.clone(),
        })?;
        info!(
            "Calling {} ({} call {})",
            peer_id,
            media_kind,
            handle.call_id()
        );

        let announce = SignalingMessage::OfferInitiate {
            call_id: handle.call_id().clone(),
            caller_id: self.local_id.clone(),
            callee_id: peer_id.clone(),
            media_kind,
            room_id,
        };
        if let Err(e) = self.ctx.relay.send(&peer_id, announce).await {
            warn!("Failed to announce call {}: {}", handle.call_id(), e);
            // Nobody will ever answer; finish the session now.
            let _ = handle.hang_up().await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Consume the inbound relay stream until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_relay_event(event).await;
        }
        debug!("Relay subscription of {} closed", self.local_id);
    }

    pub async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Message { from, message } => self.route(from, message).await,
            RelayEvent::Disconnected => {
                let sessions: Vec<CallSessionHandle> = self
                    .ctx
                    .registry
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                warn!(
                    "Relay connection of {} lost with {} calls in progress",
                    self.local_id,
                    sessions.len()
                );
                for session in sessions {
                    session.connection_lost();
                }
            }
        }
    }

    async fn route(&self, from: ParticipantId, message: SignalingMessage) {
        let message = match message {
            SignalingMessage::OfferInitiate {
                call_id,
                caller_id,
                callee_id,
                media_kind,
                room_id,
            } => {
                let incoming = IncomingCall {
                    call_id,
                    caller_id,
                    callee_id,
                    media_kind,
                    room_id,
                };
                return self.on_incoming_call(from, incoming).await;
            }
            other => other,
        };

        let Some(session) = self.session(message.call_id()) else {
            debug!(
                "Discarding {} for unknown call {}",
                message.kind(),
                message.call_id()
            );
            return;
        };
        if session.peer_id() != &from {
            warn!(
                "Ignoring {} for call {} from {}, not a participant",
                message.kind(),
                session.call_id(),
                from
            );
            return;
        }

        let kind = message.kind();
        if !session.deliver(message) {
            debug!(
                "Discarding {} for finished call {}",
                kind,
                session.call_id()
            );
        }
    }

    async fn on_incoming_call(&self, from: ParticipantId, incoming: IncomingCall) {
        if incoming.callee_id != self.local_id {
            debug!(
                "Ignoring call {} addressed to {}",
                incoming.call_id, incoming.callee_id
            );
            return;
        }
        if incoming.caller_id != from {
            warn!(
                "Ignoring call {} announced by {} on behalf of {}",
                incoming.call_id, from, incoming.caller_id
            );
            return;
        }
        if self.ctx.registry.contains_key(&incoming.call_id) {
            debug!("Ignoring repeated announcement of call {}", incoming.call_id);
            return;
        }

        let call_id = incoming.call_id.clone();
        let admitted = self.admit(NewSession {
            call_id: incoming.call_id,
            role: CallRole::Callee,
            peer_id: from.clone(),
            media_kind: incoming.media_kind,
            room_id: incoming.room_id,
        });
        match admitted {
            Ok(handle) => info!(
                "Incoming {} call {} from {}",
                handle.media_kind(),
                handle.call_id(),
                handle.peer_id()
            ),
            Err(CallError::TooManyCalls(max)) => {
                info!(
                    "Declining call {} from {}: busy with {} calls",
                    call_id, from, max
                );
                let decline = SignalingMessage::Answer {
                    call_id: call_id.clone(),
                    accepted: false,
                };
                if let Err(e) = self.ctx.relay.send(&from, decline).await {
                    warn!("Failed to decline call {}: {}", call_id, e);
                }
            }
            Err(e) => debug!("Not ringing: {}", e),
        }
    }

    /// Register a new session unless the call id is taken or the endpoint is
    /// at its call limit.
    fn admit(&self, new: NewSession) -> Result<CallSessionHandle, CallError> {
        let _admission = self
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.ctx.registry.contains_key(&new.call_id) {
            return Err(CallError::AlreadyExists(new.call_id));
        }
        let max = self.ctx.config.max_concurrent_calls;
        if self.active_count() >= max {
            return Err(CallError::TooManyCalls(max));
        }
        self.register(new)
    }

    fn register(&self, new: NewSession) -> Result<CallSessionHandle, CallError> {
        match self.ctx.registry.entry(new.call_id.clone()) {
            Entry::Occupied(_) => Err(CallError::AlreadyExists(new.call_id)),
            Entry::Vacant(slot) => {
                let handle = session::spawn(new, self.ctx.clone());
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    fn active_count(&self) -> usize {
        self.ctx
            .registry
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count()
    }

    /// Handle to a call that is still in progress.
    pub fn session(&self, call_id: &CallId) -> Option<CallSessionHandle> {
        self.ctx
            .registry
            .get(call_id)
            .map(|entry| entry.value().clone())
    }

    pub fn get_call(&self, call_id: &CallId) -> Option<CallSnapshot> {
        self.session(call_id).map(|session| session.snapshot())
    }

    /// Snapshots of every call in progress.
    pub fn active_calls(&self) -> Vec<CallSnapshot> {
        self.ctx
            .registry
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|snapshot| !snapshot.state.is_terminal())
            .collect()
    }

    pub fn has_active_call(&self) -> bool {
        self.active_count() > 0
    }

    /// Whether an incoming call is waiting for the local user.
    pub fn is_ringing(&self) -> bool {
        self.ctx.registry.iter().any(|entry| {
            let session = entry.value();
            session.role() == CallRole::Callee && session.state().is_ringing()
        })
    }

    pub async fn accept(&self, call_id: &CallId) -> Result<(), CallError> {
        self.require(call_id)?.accept().await
    }

    pub async fn reject(&self, call_id: &CallId) -> Result<(), CallError> {
        self.require(call_id)?.reject().await
    }

    pub async fn hang_up(&self, call_id: &CallId) -> Result<(), CallError> {
        self.require(call_id)?.hang_up().await
    }

    fn require(&self, call_id: &CallId) -> Result<CallSessionHandle, CallError> {
        self.session(call_id)
            .ok_or_else(|| CallError::NotFound(call_id.clone()))
    }
}
