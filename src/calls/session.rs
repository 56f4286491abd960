//! One call session.
//!
//! Each session runs as its own task that owns all of the session's state and
//! processes one input at a time: local actions, relay messages, the ring
//! timer and engine callbacks all go through the same queue. Suspension points
//! (engine calls, relay sends) therefore never interleave with other inputs of
//! the same session, while unrelated sessions run in parallel.

use std::sync::Arc;

use callcore::{
    CallError, CallId, CallRole, CallSnapshot, CallState, CallTransition, IceCandidate,
    InvalidTransition, MediaKind, ParticipantId, SessionDescription, SignalingMessage, StateCause,
};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use super::candidates::CandidateQueue;
use super::config::CallManagerConfig;
use super::engine::{
    EngineConfig, EngineEvent, EngineEvents, NegotiationEngine, NegotiationEngineFactory,
    NegotiationError, TrackOrigin,
};
use super::observer::CallObserver;
use super::relay::RelayChannel;
use super::timeout::TimeoutSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalAction {
    Accept,
    Reject,
    HangUp,
}

#[derive(Debug)]
enum SessionInput {
    Local {
        action: LocalAction,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Signal(SignalingMessage),
    Disconnected,
    Timeout {
        epoch: u64,
    },
    Engine(EngineEvent),
}

/// Live sessions of one endpoint, by call id.
pub(crate) type SessionRegistry = Arc<DashMap<CallId, CallSessionHandle>>;

/// Collaborators shared by every session of an endpoint.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub relay: Arc<dyn RelayChannel>,
    pub engines: Arc<dyn NegotiationEngineFactory>,
    pub observer: Arc<dyn CallObserver>,
    pub config: Arc<CallManagerConfig>,
    pub registry: SessionRegistry,
}

pub(crate) struct NewSession {
    pub call_id: CallId,
    pub role: CallRole,
    pub peer_id: ParticipantId,
    pub media_kind: MediaKind,
    pub room_id: Option<String>,
}

/// Handle to a running call session.
///
/// Cheap to clone. Once the session has finished, actions fail with
/// [`CallError::SessionClosed`] while the last snapshot stays readable.
#[derive(Debug, Clone)]
pub struct CallSessionHandle {
    call_id: CallId,
    role: CallRole,
    peer_id: ParticipantId,
    media_kind: MediaKind,
    inbox: mpsc::UnboundedSender<SessionInput>,
    status: watch::Receiver<CallSnapshot>,
}

impl CallSessionHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.status.borrow().clone()
    }

    /// Whether the session task has stopped.
    pub fn is_finished(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Answer an incoming call.
    pub async fn accept(&self) -> Result<(), CallError> {
        self.act(LocalAction::Accept).await
    }

    /// Decline an incoming call.
    pub async fn reject(&self) -> Result<(), CallError> {
        self.act(LocalAction::Reject).await
    }

    /// Hang up a connected call, or cancel an outgoing one that is still ringing.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.act(LocalAction::HangUp).await
    }

    /// Wait until `done` holds for the session's snapshot, or the session stops.
    pub async fn wait_until(&self, done: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut status = self.status.clone();
        loop {
            {
                let snapshot = status.borrow_and_update();
                if done(&*snapshot) {
                    return snapshot.clone();
                }
            }
            if status.changed().await.is_err() {
                return status.borrow().clone();
            }
        }
    }

    pub async fn wait_for_end(&self) -> CallSnapshot {
        self.wait_until(|snapshot| snapshot.state.is_terminal())
            .await
    }

    pub(crate) fn deliver(&self, message: SignalingMessage) -> bool {
        self.inbox.send(SessionInput::Signal(message)).is_ok()
    }

    pub(crate) fn connection_lost(&self) -> bool {
        self.inbox.send(SessionInput::Disconnected).is_ok()
    }

    async fn act(&self, action: LocalAction) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(SessionInput::Local { action, reply })
            .map_err(|_| CallError::SessionClosed(self.call_id.clone()))?;
        response
            .await
            .map_err(|_| CallError::SessionClosed(self.call_id.clone()))?
    }
}

/// Start a session task and return its handle.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn(new: NewSession, ctx: SessionContext) -> CallSessionHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let snapshot = CallSnapshot::new(
        new.call_id.clone(),
        new.role,
        new.peer_id.clone(),
        new.media_kind,
        new.room_id,
    );
    let (status_tx, status_rx) = watch::channel(snapshot.clone());

    let handle = CallSessionHandle {
        call_id: new.call_id,
        role: new.role,
        peer_id: new.peer_id,
        media_kind: new.media_kind,
        inbox: inbox_tx.clone(),
        status: status_rx,
    };

    let mut session = CallSession {
        snapshot,
        ctx,
        inbox: inbox_rx,
        feedback: inbox_tx.downgrade(),
        status: status_tx,
        engine: None,
        candidates: CandidateQueue::new(),
        pending_offer: None,
        timer: TimeoutSupervisor::new(),
    };
    session.arm_ring_timer();
    tokio::spawn(session.run());

    handle
}

struct CallSession {
    snapshot: CallSnapshot,
    ctx: SessionContext,
    inbox: mpsc::UnboundedReceiver<SessionInput>,
    /// Lets the timer and the engine feed the inbox without keeping the session alive.
    feedback: mpsc::WeakUnboundedSender<SessionInput>,
    status: watch::Sender<CallSnapshot>,
    engine: Option<Arc<dyn NegotiationEngine>>,
    candidates: CandidateQueue,
    /// Offer that reached a callee still ringing.
    pending_offer: Option<SessionDescription>,
    timer: TimeoutSupervisor,
}

impl CallSession {
    fn call_id(&self) -> &CallId {
        &self.snapshot.call_id
    }

    async fn run(mut self) {
        debug!(
            "Call {} session started as {:?} with {}",
            self.call_id(),
            self.snapshot.role,
            self.snapshot.peer_id
        );
        self.ctx
            .observer
            .on_state_changed(self.call_id(), self.snapshot.state, &StateCause::Created)
            .await;

        while let Some(input) = self.inbox.recv().await {
            self.handle(input).await;
            if self.snapshot.state.is_terminal() {
                break;
            }
        }

        // No-op after a terminal transition; covers the inbox closing underneath us.
        self.release().await;
        self.ctx.registry.remove(&self.snapshot.call_id);
        debug!(
            "Call {} session finished ({})",
            self.call_id(),
            self.snapshot.state
        );
    }

    fn arm_ring_timer(&mut self) {
        let deadline = match self.snapshot.role {
            CallRole::Caller => Some(self.ctx.config.ring_timeout),
            CallRole::Callee => self.ctx.config.callee_timeout,
        };
        let Some(deadline) = deadline else {
            return;
        };

        let feedback = self.feedback.clone();
        self.timer.arm(deadline, move |epoch| {
            if let Some(inbox) = feedback.upgrade() {
                let _ = inbox.send(SessionInput::Timeout { epoch });
            }
        });
    }

    async fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Local { action, reply } => {
                let result = self.on_local_action(action).await;
                let _ = reply.send(result);
            }
            SessionInput::Signal(message) => self.on_signal(message).await,
            SessionInput::Disconnected => {
                if let Err(e) = self.transition(CallTransition::Disconnected).await {
                    debug!("Call {}: {}", self.call_id(), e);
                }
            }
            SessionInput::Timeout { epoch } => self.on_timeout(epoch).await,
            SessionInput::Engine(event) => self.on_engine_event(event).await,
        }
    }

    /// Move along one edge of the state machine.
    ///
    /// Entering a terminal state releases the engine, queue and timer before
    /// the new state is published.
    async fn transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<CallState, InvalidTransition> {
        let previous = self.snapshot.state;
        let next = previous.apply(&transition)?;

        if !next.is_ringing() {
            self.timer.disarm();
        }
        if next.is_terminal() {
            self.release().await;
        }

        let cause = transition.cause();
        info!(
            "Call {}: {} -> {} ({:?})",
            self.call_id(),
            previous,
            next,
            cause
        );
        self.snapshot.enter(next, cause.clone());
        self.status.send_replace(self.snapshot.clone());
        self.ctx
            .observer
            .on_state_changed(&self.snapshot.call_id, next, &cause)
            .await;
        Ok(next)
    }

    async fn release(&mut self) {
        self.timer.disarm();
        self.candidates.clear();
        self.pending_offer = None;
        if let Some(engine) = self.engine.take() {
            engine.close().await;
            debug!("Released negotiation engine for call {}", self.call_id());
        }
    }

    async fn on_local_action(&mut self, action: LocalAction) -> Result<(), CallError> {
        let call_id = self.call_id().clone();
        match action {
            LocalAction::Accept => {
                self.transition(CallTransition::LocalAnswered { accepted: true })
                    .await?;
                self.send(SignalingMessage::Answer {
                    call_id,
                    accepted: true,
                })
                .await;
                self.start_callee_negotiation().await;
            }
            LocalAction::Reject => {
                self.transition(CallTransition::LocalAnswered { accepted: false })
                    .await?;
                self.send(SignalingMessage::Answer {
                    call_id,
                    accepted: false,
                })
                .await;
            }
            LocalAction::HangUp => {
                self.transition(CallTransition::LocalEnded).await?;
                self.send(SignalingMessage::End { call_id }).await;
            }
        }
        Ok(())
    }

    async fn on_timeout(&mut self, epoch: u64) {
        if !self.timer.take_fired(epoch) {
            debug!("Ignoring stale ring timeout for call {}", self.call_id());
            return;
        }
        if let Err(e) = self.transition(CallTransition::RingTimeout).await {
            debug!("Call {}: {}", self.call_id(), e);
            return;
        }

        let call_id = self.call_id().clone();
        let notice = match self.snapshot.role {
            CallRole::Caller => SignalingMessage::End { call_id },
            CallRole::Callee => SignalingMessage::Answer {
                call_id,
                accepted: false,
            },
        };
        self.send(notice).await;
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        if message.call_id() != self.call_id() {
            warn!(
                "Call {} received {} for call {}",
                self.call_id(),
                message.kind(),
                message.call_id()
            );
            return;
        }

        match message {
            SignalingMessage::OfferInitiate { .. } => {
                debug!("Ignoring repeated announcement of call {}", self.call_id());
            }
            SignalingMessage::Answer { accepted, .. } => {
                match self
                    .transition(CallTransition::RemoteAnswered { accepted })
                    .await
                {
                    Ok(CallState::Connected) => self.start_caller_negotiation().await,
                    Ok(_) => {}
                    Err(e) => debug!("Ignoring call/answer for {}: {}", self.call_id(), e),
                }
            }
            SignalingMessage::End { .. } => {
                if let Err(e) = self.transition(CallTransition::RemoteEnded).await {
                    debug!("Ignoring call/end for {}: {}", self.call_id(), e);
                }
            }
            SignalingMessage::SdpOffer { sdp, .. } => self.on_remote_offer(sdp).await,
            SignalingMessage::SdpAnswer { sdp, .. } => self.on_remote_answer(sdp).await,
            SignalingMessage::Candidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                if !self.snapshot.state.is_connected() {
                    debug!("Dropping local candidate for call {}", self.call_id());
                    return;
                }
                let call_id = self.call_id().clone();
                self.send(SignalingMessage::Candidate { call_id, candidate })
                    .await;
            }
            EngineEvent::RemoteTrack(track) => {
                self.ctx
                    .observer
                    .on_track(&self.snapshot.call_id, TrackOrigin::Remote, &track)
                    .await;
            }
        }
    }

    /// Create the engine and capture local media. `None` if that failed, in
    /// which case the failure has already been handled.
    async fn prepare_engine(&mut self) -> Option<Arc<dyn NegotiationEngine>> {
        if let Some(engine) = &self.engine {
            return Some(Arc::clone(engine));
        }

        let config = EngineConfig {
            media_kind: self.snapshot.media_kind,
            ice_servers: self.ctx.config.ice_servers.clone(),
        };
        let feedback = self.feedback.clone();
        let events = EngineEvents::new(move |event| {
            feedback
                .upgrade()
                .is_some_and(|inbox| inbox.send(SessionInput::Engine(event)).is_ok())
        });

        let engine = match self.ctx.engines.create(self.call_id(), &config, events) {
            Ok(engine) => engine,
            Err(error) => {
                // No engine means no media path, whatever the failure policy.
                warn!("Call {}: {}", self.call_id(), error);
                self.end_call(CallTransition::NegotiationFailed(error.to_string()))
                    .await;
                return None;
            }
        };
        self.engine = Some(Arc::clone(&engine));

        match engine.acquire_local_media(self.snapshot.media_kind).await {
            Ok(tracks) => {
                for track in &tracks {
                    self.ctx
                        .observer
                        .on_track(&self.snapshot.call_id, TrackOrigin::Local, track)
                        .await;
                }
                Some(engine)
            }
            Err(error) => {
                let detail = match error {
                    NegotiationError::MediaUnavailable(detail) => detail,
                    other => other.to_string(),
                };
                self.negotiation_failed(NegotiationError::MediaUnavailable(detail))
                    .await;
                None
            }
        }
    }

    async fn start_caller_negotiation(&mut self) {
        let Some(engine) = self.prepare_engine().await else {
            return;
        };
        match engine.create_local_offer().await {
            Ok(offer) => {
                let call_id = self.call_id().clone();
                self.send(SignalingMessage::SdpOffer {
                    call_id,
                    sdp: offer,
                })
                .await;
            }
            Err(error) => self.negotiation_failed(error).await,
        }
    }

    async fn start_callee_negotiation(&mut self) {
        if self.prepare_engine().await.is_none() {
            return;
        }
        if let Some(offer) = self.pending_offer.take() {
            self.answer_offer(offer).await;
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        match (self.snapshot.role, self.snapshot.state) {
            (CallRole::Callee, CallState::Ringing) => {
                debug!("Holding offer for call {} until answered", self.call_id());
                if self.pending_offer.replace(offer).is_some() {
                    warn!("Call {}: replaced an earlier held offer", self.call_id());
                }
            }
            (CallRole::Callee, CallState::Connected) if !self.candidates.is_open() => {
                self.answer_offer(offer).await;
            }
            (role, state) => {
                debug!(
                    "Ignoring webrtc/offer for call {} ({:?}, {})",
                    self.call_id(),
                    role,
                    state
                );
            }
        }
    }

    async fn answer_offer(&mut self, offer: SessionDescription) {
        let Some(engine) = self.engine.clone() else {
            debug!("Call {} has no engine to answer with", self.call_id());
            return;
        };

        if let Err(error) = engine.apply_remote_description(offer).await {
            self.negotiation_failed(error).await;
            return;
        }
        self.open_candidate_gate(&engine).await;

        match engine.create_local_answer().await {
            Ok(answer) => {
                let call_id = self.call_id().clone();
                self.send(SignalingMessage::SdpAnswer {
                    call_id,
                    sdp: answer,
                })
                .await;
            }
            Err(error) => self.negotiation_failed(error).await,
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        if !self.snapshot.state.is_connected() || self.candidates.is_open() {
            debug!(
                "Ignoring webrtc/answer for call {} in state {}",
                self.call_id(),
                self.snapshot.state
            );
            return;
        }
        let Some(engine) = self.engine.clone() else {
            debug!("Call {} has no engine for the answer", self.call_id());
            return;
        };

        match engine.apply_remote_description(answer).await {
            Ok(()) => self.open_candidate_gate(&engine).await,
            Err(error) => self.negotiation_failed(error).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.candidates.admit(candidate) {
            Some(candidate) => match self.engine.clone() {
                Some(engine) => self.apply_candidate(&engine, candidate).await,
                None => debug!("Call {} has no engine for the candidate", self.call_id()),
            },
            None => debug!(
                "Queued remote candidate for call {} ({} pending)",
                self.call_id(),
                self.candidates.len()
            ),
        }
    }

    /// The remote description is in place: flush queued candidates in order.
    async fn open_candidate_gate(&mut self, engine: &Arc<dyn NegotiationEngine>) {
        let queued = self.candidates.open();
        if !queued.is_empty() {
            debug!(
                "Applying {} queued candidates for call {}",
                queued.len(),
                self.call_id()
            );
        }
        for candidate in queued {
            self.apply_candidate(engine, candidate).await;
        }
    }

    async fn apply_candidate(&self, engine: &Arc<dyn NegotiationEngine>, candidate: IceCandidate) {
        if let Err(error) = engine.apply_candidate(candidate).await {
            warn!("Call {}: {}", self.call_id(), error);
            self.ctx
                .observer
                .on_negotiation_error(&self.snapshot.call_id, &error)
                .await;
        }
    }

    async fn negotiation_failed(&mut self, error: NegotiationError) {
        warn!("Call {}: {}", self.call_id(), error);
        let transition = match &error {
            NegotiationError::MediaUnavailable(detail) => {
                CallTransition::MediaUnavailable(detail.clone())
            }
            _ if self.ctx.config.end_on_negotiation_failure => {
                CallTransition::NegotiationFailed(error.to_string())
            }
            _ => {
                self.ctx
                    .observer
                    .on_negotiation_error(&self.snapshot.call_id, &error)
                    .await;
                return;
            }
        };

        self.end_call(transition).await;
    }

    /// Fail the call on our side and tell the peer.
    async fn end_call(&mut self, transition: CallTransition) {
        match self.transition(transition).await {
            Ok(_) => {
                let call_id = self.call_id().clone();
                self.send(SignalingMessage::End { call_id }).await;
            }
            Err(e) => debug!("Call {}: {}", self.call_id(), e),
        }
    }

    /// Send to the peer. Delivery problems are logged, never retried here.
    async fn send(&self, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(error) = self.ctx.relay.send(&self.snapshot.peer_id, message).await {
            warn!(
                "Failed to send {} for call {}: {}",
                kind,
                self.call_id(),
                error
            );
        }
    }
}
