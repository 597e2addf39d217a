//! Peer session state machine.
//!
//! A `PeerSession` is owned by exactly one `ConnectionActor` and tracks the
//! signaling lifecycle of one client:
//!
//! ```text
//! AwaitingJoin -> Joining -> Joined -> Ready -> Active -> Closing -> Disconnected
//!                    |          |________________^
//!                    v (join failed)
//!               AwaitingJoin
//! ```
//!
//! Each transport has its own negotiation state
//! (`Created -> AwaitingConnectAck -> Connected`). The session never calls the
//! media engine itself: it validates a step, hands back the engine handle to
//! use, and records the outcome once the actor reports it.

use super::pending::PendingConsumption;
use crate::errors::SfuError;
use crate::media::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId,
};
use std::collections::HashMap;

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no room joined yet.
    AwaitingJoin,
    /// Join in progress (transports being created).
    Joining,
    /// Both transports exist; the receive transport was created.
    Joined,
    /// Both transports are connected.
    Ready,
    /// At least one producer or consumer exists.
    Active,
    /// Teardown in progress.
    Closing,
    /// All resources released.
    Disconnected,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::AwaitingJoin => "awaiting_join",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Ready => "ready",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// DTLS negotiation state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    AwaitingConnectAck,
    Connected,
}

/// A transport owned by the session.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub state: NegotiationState,
    remote_dtls: Option<DtlsParameters>,
}

impl TransportRecord {
    fn new(id: TransportId, direction: TransportDirection) -> Self {
        Self {
            id,
            direction,
            state: NegotiationState::Created,
            remote_dtls: None,
        }
    }
}

/// A consumer owned by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    /// Peer whose track this consumer receives.
    pub peer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// What the actor must do to satisfy a `transportConnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectStep {
    /// Call the engine with this transport.
    Connect(TransportId),
    /// Same parameters already applied; acknowledge without an engine call.
    AlreadyConnected,
}

/// What the actor must do with a peer announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// Receive transport is connected; consume from the peer now.
    ConsumeNow,
    /// Queued until the receive transport connects.
    Queued,
    /// Own peer, duplicate, or session closing.
    Ignored,
}

/// Engine handles released by a closing session, in release order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleasedResources {
    pub consumers: Vec<ConsumerId>,
    pub producers: Vec<ProducerId>,
    pub transports: Vec<TransportId>,
}

impl ReleasedResources {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.producers.is_empty() && self.transports.is_empty()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub peer_id: Option<String>,
    pub room_id: Option<String>,
    pub send_transport: Option<NegotiationState>,
    pub recv_transport: Option<NegotiationState>,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub pending_peers: Vec<String>,
}

/// Per-connection signaling state.
#[derive(Debug)]
pub struct PeerSession {
    state: SessionState,
    peer_id: Option<String>,
    room_id: Option<String>,
    send_transport: Option<TransportRecord>,
    recv_transport: Option<TransportRecord>,
    producers: HashMap<MediaKind, ProducerId>,
    consumers: HashMap<(String, MediaKind), ConsumerRecord>,
    pending: PendingConsumption,
    rtp_capabilities: RtpCapabilities,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingJoin,
            peer_id: None,
            room_id: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            pending: PendingConsumption::new(),
            rtp_capabilities: RtpCapabilities::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(
            self.state,
            SessionState::Closing | SessionState::Disconnected
        )
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// Replace the declared receive capabilities. Empty capabilities are ignored.
    pub fn set_rtp_capabilities(&mut self, rtp_capabilities: RtpCapabilities) {
        if !rtp_capabilities.is_empty() {
            self.rtp_capabilities = rtp_capabilities;
        }
    }

    // ------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------

    /// `AwaitingJoin -> Joining`.
    pub fn begin_join(&mut self, room_id: &str) -> Result<(), SfuError> {
        match self.state {
            SessionState::AwaitingJoin => {
                self.state = SessionState::Joining;
                self.room_id = Some(room_id.to_string());
                Ok(())
            }
            SessionState::Closing | SessionState::Disconnected => Err(
                SfuError::StaleReference("session is closing".to_string()),
            ),
            SessionState::Joining => Err(SfuError::InvalidState(
                "join already in progress".to_string(),
            )),
            SessionState::Joined | SessionState::Ready | SessionState::Active => Err(
                SfuError::InvalidState("session already joined a room".to_string()),
            ),
        }
    }

    /// `Joining -> AwaitingJoin` after a failed join.
    pub fn abort_join(&mut self) {
        if self.state == SessionState::Joining {
            self.state = SessionState::AwaitingJoin;
            self.room_id = None;
        }
    }

    /// `Joining -> Joined` once both transports exist and the room accepted the peer.
    pub fn complete_join(
        &mut self,
        peer_id: String,
        recv_transport: TransportId,
        send_transport: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SfuError> {
        if self.state != SessionState::Joining {
            return Err(SfuError::InvalidState("no join in progress".to_string()));
        }
        self.peer_id = Some(peer_id);
        self.recv_transport = Some(TransportRecord::new(
            recv_transport,
            TransportDirection::Recv,
        ));
        self.send_transport = Some(TransportRecord::new(
            send_transport,
            TransportDirection::Send,
        ));
        self.set_rtp_capabilities(rtp_capabilities);
        self.state = SessionState::Joined;
        Ok(())
    }

    fn require_joined(&self) -> Result<(), SfuError> {
        match self.state {
            SessionState::Joined | SessionState::Ready | SessionState::Active => Ok(()),
            SessionState::Closing | SessionState::Disconnected => Err(
                SfuError::StaleReference("session is closing".to_string()),
            ),
            SessionState::AwaitingJoin | SessionState::Joining => {
                Err(SfuError::InvalidState("not joined to a room".to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport negotiation
    // ------------------------------------------------------------------

    fn transport(&self, direction: TransportDirection) -> Option<&TransportRecord> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    fn transport_mut(&mut self, direction: TransportDirection) -> Option<&mut TransportRecord> {
        match direction {
            TransportDirection::Send => self.send_transport.as_mut(),
            TransportDirection::Recv => self.recv_transport.as_mut(),
        }
    }

    /// Whether the transport in `direction` is `Connected`.
    #[must_use]
    pub fn is_connected(&self, direction: TransportDirection) -> bool {
        self.transport(direction)
            .is_some_and(|t| t.state == NegotiationState::Connected)
    }

    /// Validate a `transportConnect` and move the transport to `AwaitingConnectAck`.
    ///
    /// Repeating a connect with identical DTLS parameters is acknowledged
    /// without touching the engine; different parameters on a connected
    /// transport are rejected.
    pub fn begin_connect(
        &mut self,
        direction: TransportDirection,
        dtls_parameters: &DtlsParameters,
    ) -> Result<ConnectStep, SfuError> {
        self.require_joined()?;
        let transport = self
            .transport_mut(direction)
            .ok_or_else(|| SfuError::InvalidState(format!("no {direction} transport")))?;

        match transport.state {
            NegotiationState::Connected => {
                if transport.remote_dtls.as_ref() == Some(dtls_parameters) {
                    Ok(ConnectStep::AlreadyConnected)
                } else {
                    Err(SfuError::TransportConnectFailed(format!(
                        "{direction} transport already connected with different DTLS parameters"
                    )))
                }
            }
            NegotiationState::AwaitingConnectAck => Err(SfuError::InvalidState(format!(
                "{direction} transport connect already in progress"
            ))),
            NegotiationState::Created => {
                transport.state = NegotiationState::AwaitingConnectAck;
                transport.remote_dtls = Some(dtls_parameters.clone());
                Ok(ConnectStep::Connect(transport.id.clone()))
            }
        }
    }

    /// Engine confirmed the connect. Returns `true` when this connected the
    /// receive transport, i.e. the pending queue must now be flushed.
    pub fn complete_connect(&mut self, direction: TransportDirection) -> bool {
        let Some(transport) = self.transport_mut(direction) else {
            return false;
        };
        if transport.state != NegotiationState::AwaitingConnectAck {
            return false;
        }
        transport.state = NegotiationState::Connected;

        if self.state == SessionState::Joined
            && self.is_connected(TransportDirection::Send)
            && self.is_connected(TransportDirection::Recv)
        {
            self.state = SessionState::Ready;
        }
        direction == TransportDirection::Recv
    }

    /// Engine rejected the connect; the transport returns to `Created`.
    pub fn abort_connect(&mut self, direction: TransportDirection) {
        if let Some(transport) = self.transport_mut(direction) {
            if transport.state == NegotiationState::AwaitingConnectAck {
                transport.state = NegotiationState::Created;
                transport.remote_dtls = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Transport to produce `kind` on. Requires a connected send transport
    /// and no existing producer of the same kind.
    pub fn produce_transport(&self, kind: MediaKind) -> Result<TransportId, SfuError> {
        self.require_joined()?;
        let transport = self
            .send_transport
            .as_ref()
            .filter(|t| t.state == NegotiationState::Connected)
            .ok_or_else(|| SfuError::InvalidState("send transport is not connected".to_string()))?;
        if self.producers.contains_key(&kind) {
            return Err(SfuError::ProduceFailed(format!(
                "already producing {kind}"
            )));
        }
        Ok(transport.id.clone())
    }

    pub fn record_producer(&mut self, producer_id: ProducerId, kind: MediaKind) {
        self.producers.insert(kind, producer_id);
        self.promote_active();
    }

    /// Remove an owned producer, returning its kind.
    pub fn take_producer(&mut self, producer_id: &ProducerId) -> Option<MediaKind> {
        let kind = self
            .producers
            .iter()
            .find(|(_, id)| *id == producer_id)
            .map(|(kind, _)| *kind)?;
        self.producers.remove(&kind);
        Some(kind)
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Transport to consume on. Requires a connected receive transport.
    pub fn consume_transport(&self) -> Result<TransportId, SfuError> {
        self.require_joined()?;
        self.recv_transport
            .as_ref()
            .filter(|t| t.state == NegotiationState::Connected)
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                SfuError::InvalidState("receive transport is not connected".to_string())
            })
    }

    #[must_use]
    pub fn existing_consumer(&self, peer_id: &str, kind: MediaKind) -> Option<&ConsumerRecord> {
        self.consumers.get(&(peer_id.to_string(), kind))
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerRecord> {
        self.consumers.values().find(|c| &c.id == consumer_id)
    }

    pub fn consumer_mut(&mut self, consumer_id: &ConsumerId) -> Option<&mut ConsumerRecord> {
        self.consumers.values_mut().find(|c| &c.id == consumer_id)
    }

    pub fn record_consumer(&mut self, record: ConsumerRecord) {
        self.pending.mark_consumed(&record.peer_id);
        self.consumers
            .insert((record.peer_id.clone(), record.kind), record);
        self.promote_active();
    }

    /// Remove every consumer of a departed peer and forget the peer.
    pub fn remove_consumers_of_peer(&mut self, peer_id: &str) -> Vec<ConsumerRecord> {
        self.pending.forget(peer_id);
        let mut keys: Vec<_> = self
            .consumers
            .keys()
            .filter(|(peer, _)| peer == peer_id)
            .cloned()
            .collect();
        keys.sort_by_key(|(_, kind)| *kind);
        keys.iter()
            .filter_map(|key| self.consumers.remove(key))
            .collect()
    }

    /// Remove the consumer fed by `producer_id`, if any.
    pub fn remove_consumer_of_producer(
        &mut self,
        producer_id: &ProducerId,
    ) -> Option<ConsumerRecord> {
        let key = self
            .consumers
            .iter()
            .find(|(_, c)| &c.producer_id == producer_id)
            .map(|(key, _)| key.clone())?;
        self.consumers.remove(&key)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn promote_active(&mut self) {
        if matches!(self.state, SessionState::Joined | SessionState::Ready) {
            self.state = SessionState::Active;
        }
    }

    // ------------------------------------------------------------------
    // Announcements
    // ------------------------------------------------------------------

    /// Decide what to do with an announced peer.
    pub fn announce(&mut self, peer_id: &str) -> Announcement {
        if self.is_closing() || self.peer_id.as_deref() == Some(peer_id) {
            return Announcement::Ignored;
        }
        if self.is_connected(TransportDirection::Recv) {
            return Announcement::ConsumeNow;
        }
        if self.pending.enqueue(peer_id) {
            Announcement::Queued
        } else {
            Announcement::Ignored
        }
    }

    /// Take the queued announcements. `Some` exactly once per session.
    pub fn flush_pending(&mut self) -> Option<Vec<String>> {
        self.pending.flush()
    }

    #[must_use]
    pub fn pending(&self) -> &PendingConsumption {
        &self.pending
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Enter `Closing`, discard pending announcements and hand back every
    /// engine handle the session owns. Returns nothing on a second call.
    pub fn begin_close(&mut self) -> ReleasedResources {
        if self.is_closing() {
            return ReleasedResources::default();
        }
        self.state = SessionState::Closing;
        self.pending.discard();

        let mut consumers: Vec<_> = self.consumers.drain().map(|(_, c)| c.id).collect();
        consumers.sort();
        let mut producers: Vec<_> = self.producers.drain().map(|(_, id)| id).collect();
        producers.sort();
        let transports = [self.recv_transport.take(), self.send_transport.take()]
            .into_iter()
            .flatten()
            .map(|t| t.id)
            .collect();

        ReleasedResources {
            consumers,
            producers,
            transports,
        }
    }

    /// `Closing -> Disconnected`.
    pub fn finish_close(&mut self) {
        self.state = SessionState::Disconnected;
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            peer_id: self.peer_id.clone(),
            room_id: self.room_id.clone(),
            send_transport: self.send_transport.as_ref().map(|t| t.state),
            recv_transport: self.recv_transport.as_ref().map(|t| t.state),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
            pending_peers: self.pending.peers(),
        }
    }
}
