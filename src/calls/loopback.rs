//! In-process negotiation engine.
//!
//! Produces synthetic descriptions and candidates and behaves like a peer
//! connection where it matters to signaling: candidates are refused until a
//! remote description is in place, answers need a remote offer, and remote
//! tracks show up once both descriptions are set. Every call is recorded per
//! call id so tests and the demo can inspect what a session did.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use callcore::{CallId, IceCandidate, MediaKind, SdpKind, SessionDescription};
use dashmap::DashMap;
use log::debug;

use super::engine::{
    EngineConfig, EngineEvents, MediaTrack, NegotiationEngine, NegotiationEngineFactory,
    NegotiationError,
};

/// One recorded engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    AcquireMedia(MediaKind),
    CreateOffer,
    CreateAnswer,
    ApplyRemoteDescription(SdpKind),
    ApplyCandidate(String),
    Close,
}

type CallLog = Arc<DashMap<CallId, Vec<EngineCall>>>;

#[derive(Debug, Clone)]
struct LoopbackOptions {
    local_candidates: usize,
    fail_create: bool,
    fail_media: bool,
    fail_remote_description: bool,
    media_delay: Option<Duration>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            local_candidates: 2,
            fail_create: false,
            fail_media: false,
            fail_remote_description: false,
            media_delay: None,
        }
    }
}

#[derive(Debug, Default)]
struct Negotiation {
    media: Option<MediaKind>,
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    tracks_announced: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct LoopbackEngine {
    call_id: CallId,
    config: EngineConfig,
    events: EngineEvents,
    options: LoopbackOptions,
    state: Mutex<Negotiation>,
    log: CallLog,
}

impl LoopbackEngine {
    fn record(&self, call: EngineCall) {
        self.log.entry(self.call_id.clone()).or_default().push(call);
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Negotiation) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn media_kind(&self) -> MediaKind {
        self.with_state(|s| s.media).unwrap_or(self.config.media_kind)
    }

    fn tracks(&self, side: &str) -> Vec<MediaTrack> {
        let kind = self.media_kind();
        let mut tracks = vec![MediaTrack {
            id: format!("{}-{side}-audio", self.call_id),
            kind: MediaKind::Audio,
        }];
        if kind.wants_video() {
            tracks.push(MediaTrack {
                id: format!("{}-{side}-video", self.call_id),
                kind: MediaKind::Video,
            });
        }
        tracks
    }

    fn synthetic_sdp(&self, kind: SdpKind) -> String {
        let setup = match kind {
            SdpKind::Offer => "actpass",
            SdpKind::Answer => "active",
        };
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.call_id
        );
        sdp.push_str(&format!(
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=setup:{setup}\r\n"
        ));
        if self.media_kind().wants_video() {
            sdp.push_str(&format!(
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=setup:{setup}\r\n"
            ));
        }
        sdp
    }

    /// Gathering starts once a local description is set.
    fn gather_candidates(&self, kind: SdpKind) {
        let host = match kind {
            SdpKind::Offer => 10,
            SdpKind::Answer => 20,
        };
        for n in 0..self.options.local_candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 192.168.1.{host} {} typ host",
                50000 + n
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
            if !self.events.local_candidate(candidate) {
                debug!("Nobody listening for candidates of call {}", self.call_id);
                return;
            }
        }
    }

    fn announce_remote_tracks(&self) {
        let ready = self.with_state(|s| {
            let ready = s.local.is_some() && s.remote.is_some() && !s.tracks_announced;
            if ready {
                s.tracks_announced = true;
            }
            ready
        });
        if ready {
            for track in self.tracks("remote") {
                self.events.remote_track(track);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.with_state(|s| s.closed) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn acquire_local_media(
        &self,
        kind: MediaKind,
    ) -> Result<Vec<MediaTrack>, NegotiationError> {
        self.record(EngineCall::AcquireMedia(kind));
        if let Some(delay) = self.options.media_delay {
            tokio::time::sleep(delay).await;
        }
        if self.options.fail_media {
            return Err(NegotiationError::MediaUnavailable(format!(
                "no {kind} capture device"
            )));
        }
        self.ensure_open()?;
        self.with_state(|s| s.media = Some(kind));
        Ok(self.tracks("local"))
    }

    async fn create_local_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(EngineCall::CreateOffer);
        self.ensure_open()?;
        self.with_state(|s| s.local = Some(SdpKind::Offer));

        let offer = SessionDescription::offer(self.synthetic_sdp(SdpKind::Offer));
        self.gather_candidates(SdpKind::Offer);
        Ok(offer)
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(EngineCall::CreateAnswer);
        self.ensure_open()?;
        let has_offer = self.with_state(|s| {
            let has_offer = s.remote == Some(SdpKind::Offer);
            if has_offer {
                s.local = Some(SdpKind::Answer);
            }
            has_offer
        });
        if !has_offer {
            return Err(NegotiationError::Description(
                "cannot answer without a remote offer".to_string(),
            ));
        }

        let answer = SessionDescription::answer(self.synthetic_sdp(SdpKind::Answer));
        self.gather_candidates(SdpKind::Answer);
        self.announce_remote_tracks();
        Ok(answer)
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(EngineCall::ApplyRemoteDescription(description.kind));
        self.ensure_open()?;
        if self.options.fail_remote_description {
            return Err(NegotiationError::Description(format!(
                "malformed remote {:?}",
                description.kind
            )));
        }
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::Description(
                "missing version line".to_string(),
            ));
        }

        let accepted = self.with_state(|s| {
            let fits = match description.kind {
                SdpKind::Offer => s.local.is_none() && s.remote.is_none(),
                SdpKind::Answer => s.local == Some(SdpKind::Offer) && s.remote.is_none(),
            };
            if fits {
                s.remote = Some(description.kind);
            }
            fits
        });
        if !accepted {
            return Err(NegotiationError::Description(format!(
                "unexpected remote {:?}",
                description.kind
            )));
        }

        self.announce_remote_tracks();
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(EngineCall::ApplyCandidate(candidate.candidate.clone()));
        self.ensure_open()?;
        if self.with_state(|s| s.remote.is_none()) {
            return Err(NegotiationError::Candidate(
                "no remote description".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(EngineCall::Close);
        self.with_state(|s| s.closed = true);
    }
}

/// Creates [`LoopbackEngine`]s and keeps their call logs.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct LoopbackEngineFactory {
    options: LoopbackOptions,
    log: CallLog,
    created: Arc<AtomicUsize>,
}

impl LoopbackEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of local candidates gathered after each local description.
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.options.local_candidates = count;
        self
    }

    /// Engine creation always fails, as when the peer-connection stack cannot start.
    pub fn failing_creation(mut self) -> Self {
        self.options.fail_create = true;
        self
    }

    /// Media capture always fails, as with a missing camera or a denied permission.
    pub fn failing_media(mut self) -> Self {
        self.options.fail_media = true;
        self
    }

    pub fn failing_remote_description(mut self) -> Self {
        self.options.fail_remote_description = true;
        self
    }

    /// Media capture takes `delay`, like waiting on a permission prompt.
    pub fn with_media_delay(mut self, delay: Duration) -> Self {
        self.options.media_delay = Some(delay);
        self
    }

    pub fn calls(&self, call_id: &CallId) -> Vec<EngineCall> {
        self.log
            .get(call_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Candidates handed to the engine of `call_id`, in order.
    pub fn applied_candidates(&self, call_id: &CallId) -> Vec<String> {
        self.calls(call_id)
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::ApplyCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self, call_id: &CallId) -> usize {
        self.calls(call_id)
            .iter()
            .filter(|call| **call == EngineCall::Close)
            .count()
    }

    pub fn engines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl NegotiationEngineFactory for LoopbackEngineFactory {
    fn create(
        &self,
        call_id: &CallId,
        config: &EngineConfig,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        if self.options.fail_create {
            return Err(NegotiationError::EngineUnavailable(format!(
                "cannot start a peer connection for call {call_id}"
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Creating loopback engine for call {} ({}, {} ICE servers)",
            call_id,
            config.media_kind,
            config.ice_servers.len()
        );
        Ok(Arc::new(LoopbackEngine {
            call_id: call_id.clone(),
            config: config.clone(),
            events,
            options: self.options.clone(),
            state: Mutex::new(Negotiation::default()),
            log: Arc::clone(&self.log),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::engine::EngineEvent;

    fn engine(
        factory: &LoopbackEngineFactory,
        kind: MediaKind,
    ) -> (Arc<dyn NegotiationEngine>, Arc<Mutex<Vec<EngineEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let events = EngineEvents::new(move |event| {
            sink.lock().unwrap().push(event);
            true
        });
        let config = EngineConfig {
            media_kind: kind,
            ice_servers: vec![],
        };
        let engine = factory
            .create(&CallId::new("c1"), &config, events)
            .unwrap();
        (engine, seen)
    }

    #[tokio::test]
    async fn test_candidate_needs_remote_description() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _) = engine(&factory, MediaKind::Audio);

        let early = engine.apply_candidate(IceCandidate::new("candidate:0")).await;
        assert!(matches!(early, Err(NegotiationError::Candidate(_))));

        engine
            .apply_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        engine
            .apply_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        assert_eq!(
            factory.applied_candidates(&CallId::new("c1")),
            vec!["candidate:0", "candidate:1"]
        );
    }

    #[tokio::test]
    async fn test_offer_gathers_candidates_and_answer_yields_tracks() {
        let factory = LoopbackEngineFactory::new().with_local_candidates(3);
        let (engine, seen) = engine(&factory, MediaKind::Video);

        engine.acquire_local_media(MediaKind::Video).await.unwrap();
        let offer = engine.create_local_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=video"));

        engine
            .apply_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        let candidates = seen
            .iter()
            .filter(|e| matches!(e, EngineEvent::LocalCandidate(_)))
            .count();
        let tracks = seen
            .iter()
            .filter(|e| matches!(e, EngineEvent::RemoteTrack(_)))
            .count();
        assert_eq!(candidates, 3);
        assert_eq!(tracks, 2);
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _) = engine(&factory, MediaKind::Audio);

        let result = engine.create_local_answer().await;
        assert!(matches!(result, Err(NegotiationError::Description(_))));
    }

    #[tokio::test]
    async fn test_closed_engine_refuses_work() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _) = engine(&factory, MediaKind::Audio);

        engine.close().await;
        assert_eq!(
            engine.create_local_offer().await,
            Err(NegotiationError::Closed)
        );
        assert_eq!(factory.close_count(&CallId::new("c1")), 1);
    }

    #[tokio::test]
    async fn test_failing_media() {
        let factory = LoopbackEngineFactory::new().failing_media();
        let (engine, _) = engine(&factory, MediaKind::Video);

        let result = engine.acquire_local_media(MediaKind::Video).await;
        assert!(matches!(result, Err(NegotiationError::MediaUnavailable(_))));
    }
}
