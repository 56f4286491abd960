//! Relay channel between call participants.
//!
//! Outbound messages go through [`RelayChannel::send`]; inbound traffic
//! arrives as a stream of [`RelayEvent`]s that the owner hands to
//! [`CallManager::run`](super::CallManager::run). Both halves are obtained
//! together when connecting, so the subscription lives exactly as long as the
//! manager consuming it.

use std::sync::Arc;

use async_trait::async_trait;
use callcore::{CallError, ParticipantId, SignalingMessage};
use dashmap::DashMap;
use log::debug;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message {
        from: ParticipantId,
        message: SignalingMessage,
    },
    /// Connectivity to the relay was lost. Affects every call on this endpoint.
    Disconnected,
}

/// Outbound half of the relay.
///
/// Implementations must deliver messages from one sender to one recipient in
/// send order. They own any retry policy; callers never resend.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    fn local_id(&self) -> &ParticipantId;

    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> Result<(), CallError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: ParticipantId,
    pub message: SignalingMessage,
}

/// In-process relay server. Each participant connects once and gets a
/// [`MemoryRelay`] plus its inbound event stream.
///
/// Messages cross the hub as JSON text, the same way they would cross a socket.
#[derive(Debug, Default)]
pub struct MemoryRelayHub {
    links: DashMap<ParticipantId, mpsc::UnboundedSender<RelayEvent>>,
}

impl MemoryRelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `id`. A previous connection under the same id is dropped and
    /// told it was disconnected.
    pub fn connect(
        self: &Arc<Self>,
        id: impl Into<ParticipantId>,
    ) -> (MemoryRelay, mpsc::UnboundedReceiver<RelayEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(previous) = self.links.insert(id.clone(), tx) {
            let _ = previous.send(RelayEvent::Disconnected);
        }
        debug!("{} connected to relay", id);

        let relay = MemoryRelay {
            hub: Arc::clone(self),
            local: id,
            sent: Mutex::new(Vec::new()),
        };
        (relay, rx)
    }

    /// Drop the connection of `id`, emitting [`RelayEvent::Disconnected`] to it.
    pub fn disconnect(&self, id: &ParticipantId) -> bool {
        match self.links.remove(id) {
            Some((_, link)) => {
                debug!("{} disconnected from relay", id);
                let _ = link.send(RelayEvent::Disconnected);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.links.contains_key(id)
    }

    fn deliver(&self, from: &ParticipantId, to: &ParticipantId, wire: &str) -> Result<(), CallError> {
        let message = SignalingMessage::from_json(wire)?;
        let link = self
            .links
            .get(to)
            .ok_or_else(|| CallError::Relay(format!("{to} is not connected")))?;
        link.send(RelayEvent::Message {
            from: from.clone(),
            message,
        })
        .map_err(|_| CallError::Relay(format!("{to} stopped listening")))
    }
}

/// One participant's connection to a [`MemoryRelayHub`].
#[derive(Debug)]
pub struct MemoryRelay {
    hub: Arc<MemoryRelayHub>,
    local: ParticipantId,
    sent: Mutex<Vec<SentMessage>>,
}

impl MemoryRelay {
    /// Everything delivered from this connection so far, in send order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub fn hub(&self) -> &Arc<MemoryRelayHub> {
        &self.hub
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    async fn send(&self, to: &ParticipantId, message: SignalingMessage) -> Result<(), CallError> {
        if !self.hub.is_connected(&self.local) {
            return Err(CallError::Relay(format!(
                "{} is not connected to the relay",
                self.local
            )));
        }

        let wire = message.to_json()?;
        debug!("relay {} -> {}: {}", self.local, to, wire);

        // Hold the log lock across delivery so the log order matches the wire order.
        let mut sent = self.sent.lock().await;
        self.hub.deliver(&self.local, to, &wire)?;
        sent.push(SentMessage {
            to: to.clone(),
            message,
        });
        Ok(())
    }
}
