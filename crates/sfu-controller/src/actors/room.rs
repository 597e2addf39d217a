//! `RoomActor` - one per room, owns the router and the peer set.
//!
//! Every mutation of a room (peer arrival and departure, producer
//! publication) goes through this actor's mailbox, so changes to one room
//! are serialised while independent rooms run on independent tasks.
//!
//! # Notification Ordering
//!
//! A `NewPeer` notification is pushed to the existing peers only after the
//! newcomer has been inserted into the peer set, and before the newcomer's
//! join is acknowledged. Peers are notified in arrival order.
//!
//! # Lifecycle
//!
//! The room closes itself when its last peer leaves, or when it never had a
//! peer and the empty-room TTL expires. Closing releases the router, removes
//! the room from the registry and then cancels the actor.

use crate::errors::SfuError;
use crate::media::{EngineHandle, MediaKind, ProducerId, RouterInfo, SharedMediaEngine};

use super::messages::{
    JoinSnapshot, ProducerInfo, RemovalOutcome, RoomMessage, RoomNotification, RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Upper bound on how often an empty room checks its TTL.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Per-room limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomSettings {
    /// Maximum number of peers in one room.
    pub max_peers: usize,
    /// How long a room that never had a peer is kept.
    pub empty_room_ttl: Duration,
    /// Bound on media engine calls made by the room.
    pub request_timeout: Duration,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    router: Arc<RouterInfo>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Router allocated for this room.
    #[must_use]
    pub fn router(&self) -> &RouterInfo {
        &self.router
    }

    /// Add a peer. Existing peers are notified before this returns.
    ///
    /// `notifier` receives every later notification for this peer.
    pub async fn add_peer(
        &self,
        peer_id: String,
        notifier: mpsc::UnboundedSender<RoomNotification>,
    ) -> Result<JoinSnapshot, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            RoomMessage::AddPeer {
                peer_id,
                notifier,
                respond_to: tx,
            },
            rx,
        )
        .await
        .map_err(|e| match e {
            SfuError::StaleReference(_) => SfuError::RoomNotFound(self.room_id.clone()),
            other => other,
        })
    }

    /// Remove a peer and its producers.
    pub async fn remove_peer(&self, peer_id: String) -> Result<RemovalOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            RoomMessage::RemovePeer {
                peer_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Publish a producer owned by `peer_id`.
    pub async fn publish_producer(
        &self,
        peer_id: String,
        producer: ProducerInfo,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            RoomMessage::PublishProducer {
                peer_id,
                producer,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Withdraw a producer owned by `peer_id`.
    pub async fn unpublish_producer(
        &self,
        peer_id: String,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            RoomMessage::UnpublishProducer {
                peer_id,
                producer_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Live producers of a peer in the room.
    pub async fn peer_producers(&self, peer_id: String) -> Result<Vec<ProducerInfo>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.call(
            RoomMessage::PeerProducers {
                peer_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Get the current room state.
    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Cancel the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn call<T>(
        &self,
        message: RoomMessage,
        rx: oneshot::Receiver<Result<T, SfuError>>,
    ) -> Result<T, SfuError> {
        self.sender.send(message).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> SfuError {
        SfuError::StaleReference(format!("room {} is closed", self.room_id))
    }
}

/// A peer in the room.
struct RoomPeer {
    peer_id: String,
    notifier: mpsc::UnboundedSender<RoomNotification>,
    producers: BTreeMap<MediaKind, ProducerId>,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    router: Arc<RouterInfo>,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    registry: RoomRegistryHandle,
    engine: SharedMediaEngine,
    settings: RoomSettings,
    /// Peers in arrival order.
    peers: Vec<RoomPeer>,
    /// Whether any peer has ever joined.
    ever_joined: bool,
    /// Set once the room started closing; no new peers are accepted.
    is_closing: bool,
    router_released: bool,
    created_at: Instant,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor for an allocated router.
    pub fn spawn(
        room_id: String,
        router: RouterInfo,
        cancel_token: CancellationToken,
        registry: RoomRegistryHandle,
        engine: SharedMediaEngine,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let router = Arc::new(router);

        let actor = Self {
            room_id: room_id.clone(),
            router: Arc::clone(&router),
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            engine,
            settings,
            peers: Vec::new(),
            ever_joined: false,
            is_closing: false,
            router_released: false,
            created_at: Instant::now(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            router,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id,
            "RoomActor started"
        );

        let mut idle_check =
            tokio::time::interval(self.settings.empty_room_ttl.min(IDLE_CHECK_INTERVAL));

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = idle_check.tick() => {
                    self.check_idle().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::AddPeer {
                peer_id,
                notifier,
                respond_to,
            } => {
                let result = self.add_peer(peer_id, notifier);
                let _ = respond_to.send(result);
            }

            RoomMessage::RemovePeer {
                peer_id,
                respond_to,
            } => {
                let result = self.remove_peer(&peer_id);
                match result {
                    Ok(outcome) if outcome.room_closed => {
                        // Registry entry goes before the acknowledgement so a
                        // follow-up createRoom for the same ID succeeds.
                        self.close_room("last peer left").await;
                        let _ = respond_to.send(Ok(outcome));
                        self.cancel_token.cancel();
                    }
                    other => {
                        let _ = respond_to.send(other);
                    }
                }
            }

            RoomMessage::PublishProducer {
                peer_id,
                producer,
                respond_to,
            } => {
                let result = self.publish_producer(&peer_id, producer);
                let _ = respond_to.send(result);
            }

            RoomMessage::UnpublishProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.unpublish_producer(&peer_id, producer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::PeerProducers {
                peer_id,
                respond_to,
            } => {
                let result = self.peer_producers(&peer_id);
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    fn add_peer(
        &mut self,
        peer_id: String,
        notifier: mpsc::UnboundedSender<RoomNotification>,
    ) -> Result<JoinSnapshot, SfuError> {
        if self.is_closing {
            return Err(SfuError::RoomNotFound(self.room_id.clone()));
        }
        if self.peers.iter().any(|p| p.peer_id == peer_id) {
            return Err(SfuError::PeerAlreadyJoined(peer_id));
        }
        if self.peers.len() >= self.settings.max_peers {
            return Err(SfuError::RoomFull(self.room_id.clone()));
        }

        let existing_peers: Vec<String> = self.peers.iter().map(|p| p.peer_id.clone()).collect();

        self.peers.push(RoomPeer {
            peer_id: peer_id.clone(),
            notifier,
            producers: BTreeMap::new(),
        });
        self.ever_joined = true;
        self.metrics.peer_joined();

        self.broadcast(
            &peer_id,
            &RoomNotification::NewPeer {
                peer_id: peer_id.clone(),
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer joined room"
        );

        Ok(JoinSnapshot { existing_peers })
    }

    fn remove_peer(&mut self, peer_id: &str) -> Result<RemovalOutcome, SfuError> {
        let index = self
            .peers
            .iter()
            .position(|p| p.peer_id == peer_id)
            .ok_or_else(|| SfuError::StaleReference(format!("peer {peer_id} is not in the room")))?;

        let peer = self.peers.remove(index);
        self.metrics.peer_left();

        self.broadcast(
            peer_id,
            &RoomNotification::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producers_removed = peer.producers.len(),
            peer_count = self.peers.len(),
            "Peer left room"
        );

        Ok(RemovalOutcome {
            room_closed: self.peers.is_empty(),
        })
    }

    fn publish_producer(&mut self, peer_id: &str, producer: ProducerInfo) -> Result<(), SfuError> {
        let peer = self
            .peers
            .iter_mut()
            .find(|p| p.peer_id == peer_id)
            .ok_or_else(|| SfuError::StaleReference(format!("peer {peer_id} is not in the room")))?;
        peer.producers
            .insert(producer.kind, producer.producer_id.clone());

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer.producer_id,
            kind = %producer.kind,
            "Producer published"
        );

        self.broadcast(
            peer_id,
            &RoomNotification::ProducerAvailable {
                peer_id: peer_id.to_string(),
                producer,
            },
        );
        Ok(())
    }

    fn unpublish_producer(&mut self, peer_id: &str, producer_id: ProducerId) -> Result<(), SfuError> {
        let peer = self
            .peers
            .iter_mut()
            .find(|p| p.peer_id == peer_id)
            .ok_or_else(|| SfuError::StaleReference(format!("peer {peer_id} is not in the room")))?;
        let before = peer.producers.len();
        peer.producers.retain(|_, id| *id != producer_id);
        if peer.producers.len() == before {
            return Ok(());
        }

        self.broadcast(
            peer_id,
            &RoomNotification::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id,
            },
        );
        Ok(())
    }

    fn peer_producers(&self, peer_id: &str) -> Result<Vec<ProducerInfo>, SfuError> {
        self.peers
            .iter()
            .find(|p| p.peer_id == peer_id)
            .map(|peer| {
                peer.producers
                    .iter()
                    .map(|(kind, producer_id)| ProducerInfo {
                        producer_id: producer_id.clone(),
                        kind: *kind,
                    })
                    .collect()
            })
            .ok_or_else(|| SfuError::ConsumeFailed(format!("peer {peer_id} is not in the room")))
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            router_id: self.router.id.clone(),
            peers: self.peers.iter().map(|p| p.peer_id.clone()).collect(),
            producer_count: self.peers.iter().map(|p| p.producers.len()).sum(),
            is_closing: self.is_closing,
        }
    }

    /// Push a notification to every peer except `origin`, in arrival order.
    fn broadcast(&self, origin: &str, notification: &RoomNotification) {
        for peer in self.peers.iter().filter(|p| p.peer_id != origin) {
            if peer.notifier.send(notification.clone()).is_err() {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer.peer_id,
                    "Peer connection gone, notification dropped"
                );
            }
        }
    }

    /// Close a room that never had a peer once its TTL expired.
    async fn check_idle(&mut self) {
        if self.ever_joined || self.is_closing {
            return;
        }
        if self.created_at.elapsed() < self.settings.empty_room_ttl {
            return;
        }
        self.close_room("empty room TTL expired").await;
        self.cancel_token.cancel();
    }

    /// Release the router and leave the registry.
    async fn close_room(&mut self, reason: &str) {
        self.is_closing = true;
        self.release_router().await;

        let router_id = self.router.id.clone();
        tokio::select! {
            result = self.registry.remove_room(self.room_id.clone(), router_id) => {
                if let Err(e) = result {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        error = %e,
                        "Registry removal failed"
                    );
                }
            }
            () = self.cancel_token.cancelled() => {}
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            reason = reason,
            "Room closed"
        );
    }

    async fn release_router(&mut self) {
        if self.router_released {
            return;
        }
        self.router_released = true;

        let handle = EngineHandle::Router(self.router.id.clone());
        match tokio::time::timeout(self.settings.request_timeout, self.engine.close(handle)).await {
            Ok(Ok(())) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    router_id = %self.router.id,
                    "Router released"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    router_id = %self.router.id,
                    error = %e,
                    "Router release failed"
                );
            }
            Err(_) => {
                crate::observability::metrics::record_engine_timeout("closeRouter");
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    router_id = %self.router.id,
                    "Router release timed out"
                );
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        self.is_closing = true;
        for _ in self.peers.drain(..) {
            self.metrics.peer_left();
        }
        self.release_router().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::registry::RegistrySettings;
    use crate::media::LoopbackEngine;

    fn settings(max_peers: usize) -> RegistrySettings {
        RegistrySettings {
            max_rooms: 10,
            request_timeout: Duration::from_secs(5),
            room: RoomSettings {
                max_peers,
                empty_room_ttl: Duration::from_secs(300),
                request_timeout: Duration::from_secs(5),
            },
        }
    }

    async fn room(max_peers: usize) -> (RoomRegistryHandle, RoomActorHandle, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::default());
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as SharedMediaEngine,
            settings(max_peers),
            ActorMetrics::new(),
        );
        registry.create_room("room-1".to_string()).await.unwrap();
        let room = registry.get_room("room-1".to_string()).await.unwrap();
        (registry, room, engine)
    }

    fn notifier() -> (
        mpsc::UnboundedSender<RoomNotification>,
        mpsc::UnboundedReceiver<RoomNotification>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_add_peer_notifies_existing_peers_only() {
        let (registry, room, _engine) = room(10).await;
        let (alice_tx, mut alice_rx) = notifier();
        let (bob_tx, mut bob_rx) = notifier();

        let snapshot = room.add_peer("alice".to_string(), alice_tx).await.unwrap();
        assert!(snapshot.existing_peers.is_empty());

        let snapshot = room.add_peer("bob".to_string(), bob_tx).await.unwrap();
        assert_eq!(snapshot.existing_peers, vec!["alice"]);

        assert_eq!(
            alice_rx.try_recv().unwrap(),
            RoomNotification::NewPeer {
                peer_id: "bob".to_string()
            }
        );
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err(), "newcomer is never told about itself");

        registry.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_peer_and_capacity() {
        let (registry, room, _engine) = room(2).await;

        room.add_peer("alice".to_string(), notifier().0).await.unwrap();
        let result = room.add_peer("alice".to_string(), notifier().0).await;
        assert!(matches!(result, Err(SfuError::PeerAlreadyJoined(_))));

        room.add_peer("bob".to_string(), notifier().0).await.unwrap();
        let result = room.add_peer("carol".to_string(), notifier().0).await;
        assert!(matches!(result, Err(SfuError::RoomFull(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_producer_directory_and_fan_out() {
        let (registry, room, _engine) = room(10).await;
        let (alice_tx, mut alice_rx) = notifier();
        room.add_peer("alice".to_string(), alice_tx).await.unwrap();
        room.add_peer("bob".to_string(), notifier().0).await.unwrap();
        let _ = alice_rx.try_recv();

        let video = ProducerInfo {
            producer_id: ProducerId::from("p-video"),
            kind: MediaKind::Video,
        };
        let audio = ProducerInfo {
            producer_id: ProducerId::from("p-audio"),
            kind: MediaKind::Audio,
        };
        room.publish_producer("bob".to_string(), video.clone())
            .await
            .unwrap();
        room.publish_producer("bob".to_string(), audio.clone())
            .await
            .unwrap();

        let producers = room.peer_producers("bob".to_string()).await.unwrap();
        assert_eq!(producers, vec![audio, video.clone()]);

        assert_eq!(
            alice_rx.try_recv().unwrap(),
            RoomNotification::ProducerAvailable {
                peer_id: "bob".to_string(),
                producer: video,
            }
        );

        room.unpublish_producer("bob".to_string(), ProducerId::from("p-video"))
            .await
            .unwrap();
        let _ = alice_rx.try_recv();
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            RoomNotification::ProducerClosed {
                peer_id: "bob".to_string(),
                producer_id: ProducerId::from("p-video"),
            }
        );

        let result = room.peer_producers("nobody".to_string()).await;
        assert!(matches!(result, Err(SfuError::ConsumeFailed(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_last_peer_leaving_closes_room() {
        let (registry, room, engine) = room(10).await;
        let (alice_tx, mut alice_rx) = notifier();
        room.add_peer("alice".to_string(), alice_tx).await.unwrap();
        room.add_peer("bob".to_string(), notifier().0).await.unwrap();

        let outcome = room.remove_peer("bob".to_string()).await.unwrap();
        assert!(!outcome.room_closed);
        let _ = alice_rx.try_recv();
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            RoomNotification::PeerLeft {
                peer_id: "bob".to_string()
            }
        );

        let outcome = room.remove_peer("alice".to_string()).await.unwrap();
        assert!(outcome.room_closed);

        // Removal is acknowledged only after the registry forgot the room.
        assert!(registry.list_rooms().await.unwrap().is_empty());
        assert_eq!(engine.resource_counts().await.routers, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_removing_unknown_peer_is_stale() {
        let (registry, room, _engine) = room(10).await;
        let result = room.remove_peer("ghost".to_string()).await;
        assert!(matches!(result, Err(SfuError::StaleReference(_))));
        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_joined_room_expires() {
        let engine = Arc::new(LoopbackEngine::default());
        let mut settings = settings(10);
        settings.room.empty_room_ttl = Duration::from_secs(60);
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as SharedMediaEngine,
            settings,
            ActorMetrics::new(),
        );
        registry.create_room("idle".to_string()).await.unwrap();
        assert_eq!(registry.list_rooms().await.unwrap(), vec!["idle"]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(registry.list_rooms().await.unwrap().is_empty());
        assert_eq!(engine.resource_counts().await.routers, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_cancel_releases_router() {
        let (registry, room, engine) = room(10).await;
        room.add_peer("alice".to_string(), notifier().0).await.unwrap();

        registry.close_room("room-1".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(room.is_cancelled());
        assert_eq!(engine.resource_counts().await.routers, 0);
        assert!(matches!(
            room.add_peer("bob".to_string(), notifier().0).await,
            Err(SfuError::RoomNotFound(_))
        ));

        registry.cancel();
    }
}
