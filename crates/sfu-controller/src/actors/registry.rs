//! `RoomRegistryActor` - singleton owner of the room ID namespace.
//!
//! The registry is the top-level actor:
//!
//! - Maps room IDs to slots: `Allocating` while the router is being created,
//!   `Active` once the room actor runs
//! - Owns the root `CancellationToken`; each room gets a child token
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! `createRoom` reserves the slot inside the message loop before any engine
//! call, so two concurrent creates for one ID yield exactly one success and
//! one `RoomAlreadyExists`. Router allocation runs on a spawned task that
//! reports back with `RouterAllocated`; the loop never awaits the engine or a
//! room actor.
//!
//! # Graceful Shutdown
//!
//! On shutdown the registry stops accepting rooms, cancels every room actor
//! (each releases its router) and waits for them before replying.

use crate::config::Config;
use crate::errors::{Operation, SfuError};
use crate::media::{EngineHandle, RouterId, RouterInfo, SharedMediaEngine};
use crate::observability::metrics as prom;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a removed room actor gets to finish before we stop waiting.
const ROOM_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for each room actor.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Maximum number of rooms (allocating or active).
    pub max_rooms: usize,
    /// Bound on router allocation.
    pub request_timeout: Duration,
    pub room: RoomSettings,
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            max_rooms: config.max_rooms,
            request_timeout: config.request_timeout,
            room: RoomSettings {
                max_peers: config.max_peers_per_room,
                empty_room_ttl: config.empty_room_ttl,
                request_timeout: config.request_timeout,
            },
        }
    }
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(
        instance_id: String,
        engine: SharedMediaEngine,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            instance_id,
            receiver,
            weak_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            engine,
            settings,
            rooms: HashMap::new(),
            accepting_new: true,
            shutdown_waiters: Vec::new(),
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Create a room and allocate its router.
    pub async fn create_room(&self, room_id: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get a handle to a running room.
    pub async fn get_room(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a room whose router has been released (called by the room).
    pub async fn remove_room(&self, room_id: String, router_id: RouterId) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveRoom {
                room_id,
                router_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Tear down a room explicitly.
    pub async fn close_room(&self, room_id: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::CloseRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// IDs of running rooms, sorted.
    pub async fn list_rooms(&self) -> Result<Vec<String>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::ListRooms { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Graceful shutdown. Returns once every room actor has stopped.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A running room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Room creation timestamp.
    created_at: i64,
}

enum RoomSlot {
    /// Router allocation in flight.
    Allocating,
    Active(ManagedRoom),
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Lets allocation tasks report back without keeping the mailbox open.
    weak_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    engine: SharedMediaEngine,
    settings: RegistrySettings,
    rooms: HashMap<String, RoomSlot>,
    accepting_new: bool,
    shutdown_waiters: Vec<oneshot::Sender<Result<(), SfuError>>>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            max_rooms = self.settings.max_rooms,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                instance_id = %self.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                room_id,
                respond_to,
            } => {
                if let Err(e) = self.reserve_room(&room_id) {
                    let _ = respond_to.send(Err(e));
                    return;
                }
                self.allocate_router(room_id, respond_to);
            }

            RegistryMessage::RouterAllocated {
                room_id,
                result,
                respond_to,
            } => {
                let result = self.activate_room(room_id, result);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_room(&room_id));
            }

            RegistryMessage::RemoveRoom {
                room_id,
                router_id,
                respond_to,
            } => {
                self.remove_room(&room_id, Some(&router_id));
                let _ = respond_to.send(Ok(()));
            }

            RegistryMessage::CloseRoom {
                room_id,
                respond_to,
            } => {
                let result = if self.remove_room(&room_id, None) {
                    Ok(())
                } else {
                    Err(SfuError::RoomNotFound(room_id))
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::ListRooms { respond_to } => {
                let mut rooms: Vec<String> = self
                    .rooms
                    .iter()
                    .filter(|(_, slot)| matches!(slot, RoomSlot::Active(_)))
                    .map(|(room_id, _)| room_id.clone())
                    .collect();
                rooms.sort();
                let _ = respond_to.send(rooms);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "sfu.actor.registry",
                    instance_id = %self.instance_id,
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.shutdown_waiters.push(respond_to);
                self.cancel_token.cancel();
            }
        }
    }

    /// Check-and-insert of the `Allocating` slot.
    fn reserve_room(&mut self, room_id: &str) -> Result<(), SfuError> {
        if !self.accepting_new {
            return Err(SfuError::Draining);
        }
        if room_id.is_empty() {
            return Err(SfuError::InvalidMessage("roomId must not be empty".to_string()));
        }
        if self.rooms.contains_key(room_id) {
            return Err(SfuError::RoomAlreadyExists(room_id.to_string()));
        }
        if self.rooms.len() >= self.settings.max_rooms {
            warn!(
                target: "sfu.actor.registry",
                instance_id = %self.instance_id,
                max_rooms = self.settings.max_rooms,
                "Room capacity reached"
            );
            return Err(SfuError::CapacityExceeded);
        }

        self.rooms.insert(room_id.to_string(), RoomSlot::Allocating);
        debug!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            "Room reserved, allocating router"
        );
        Ok(())
    }

    /// Allocate the router off the message loop and report back.
    fn allocate_router(
        &self,
        room_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    ) {
        let engine = Arc::clone(&self.engine);
        let weak_sender = self.weak_sender.clone();
        let timeout = self.settings.request_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, engine.create_router()).await {
                Ok(Ok(router)) => Ok(router),
                Ok(Err(e)) => Err(SfuError::from_engine(Operation::CreateRoom, e)),
                Err(_) => {
                    prom::record_engine_timeout(Operation::CreateRoom.as_str());
                    Err(SfuError::EngineUnavailable(format!(
                        "router allocation timed out after {}s",
                        timeout.as_secs()
                    )))
                }
            };

            let message = RegistryMessage::RouterAllocated {
                room_id,
                result,
                respond_to,
            };
            let undelivered = match weak_sender.upgrade() {
                Some(sender) => sender.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };

            // Registry is gone; do not leak the router.
            if let Some(RegistryMessage::RouterAllocated {
                result: Ok(router), ..
            }) = undelivered
            {
                let _ = engine.close(EngineHandle::Router(router.id)).await;
            }
        });
    }

    fn activate_room(
        &mut self,
        room_id: String,
        result: Result<RouterInfo, SfuError>,
    ) -> Result<(), SfuError> {
        let reserved = matches!(self.rooms.get(&room_id), Some(RoomSlot::Allocating));

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                if reserved {
                    self.rooms.remove(&room_id);
                }
                warn!(
                    target: "sfu.actor.registry",
                    instance_id = %self.instance_id,
                    room_id = %room_id,
                    error = %e,
                    "Router allocation failed"
                );
                return Err(e);
            }
        };

        let registry = self.weak_sender.upgrade().map(|sender| RoomRegistryHandle {
            sender,
            cancel_token: self.cancel_token.clone(),
        });

        let registry = match registry {
            Some(registry) if reserved && self.accepting_new => registry,
            _ => {
                if reserved {
                    self.rooms.remove(&room_id);
                }
                self.release_router(router.id);
                return Err(if self.accepting_new {
                    SfuError::Internal("room reservation lost".to_string())
                } else {
                    SfuError::Draining
                });
            }
        };

        let router_id = router.id.clone();
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            router,
            self.cancel_token.child_token(),
            registry,
            Arc::clone(&self.engine),
            self.settings.room,
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            RoomSlot::Active(ManagedRoom {
                handle,
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            }),
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            router_id = %router_id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(())
    }

    fn get_room(&self, room_id: &str) -> Result<RoomActorHandle, SfuError> {
        match self.rooms.get(room_id) {
            Some(RoomSlot::Active(managed)) if !managed.handle.is_cancelled() => {
                Ok(managed.handle.clone())
            }
            _ => Err(SfuError::RoomNotFound(room_id.to_string())),
        }
    }

    /// Remove an active room. With `router_id`, only the room owning that
    /// router is removed. Returns whether a room was removed.
    fn remove_room(&mut self, room_id: &str, router_id: Option<&RouterId>) -> bool {
        let matches = match self.rooms.get(room_id) {
            Some(RoomSlot::Active(managed)) => {
                router_id.map_or(true, |id| managed.handle.router().id == *id)
            }
            _ => false,
        };
        if !matches {
            return false;
        }
        let Some(RoomSlot::Active(managed)) = self.rooms.remove(room_id) else {
            return false;
        };

        managed.handle.cancel();

        let room_id_owned = room_id.to_string();
        let instance_id = self.instance_id.clone();
        let lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at;
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_REMOVAL_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        self.metrics.room_removed();

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            lifetime_secs,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
        true
    }

    fn release_router(&self, router_id: RouterId) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let _ = engine.close(EngineHandle::Router(router_id)).await;
        });
    }

    fn get_status(&self) -> RegistryStatus {
        let allocating_count = self
            .rooms
            .values()
            .filter(|slot| matches!(slot, RoomSlot::Allocating))
            .count();
        RegistryStatus {
            room_count: self.rooms.len() - allocating_count,
            allocating_count,
            peer_count: self.metrics.peer_count(),
            connection_count: self.metrics.connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for slot in self.rooms.values() {
            if let RoomSlot::Active(managed) = slot {
                managed.handle.cancel();
            }
        }

        for (room_id, slot) in self.rooms.drain() {
            let RoomSlot::Active(managed) = slot else {
                continue;
            };
            match tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Reap room actors that stopped without going through removal.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter_map(|(room_id, slot)| match slot {
                RoomSlot::Active(managed) if managed.task_handle.is_finished() => {
                    Some(room_id.clone())
                }
                _ => None,
            })
            .collect();

        for room_id in finished {
            let Some(RoomSlot::Active(managed)) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            instance_id = %self.instance_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            // The router may still be allocated if the actor died early.
            self.release_router(managed.handle.router().id.clone());
            self.metrics.room_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::LoopbackEngine;

    fn settings(max_rooms: usize) -> RegistrySettings {
        RegistrySettings {
            max_rooms,
            request_timeout: Duration::from_secs(5),
            room: RoomSettings {
                max_peers: 10,
                empty_room_ttl: Duration::from_secs(300),
                request_timeout: Duration::from_secs(5),
            },
        }
    }

    fn registry(max_rooms: usize) -> (RoomRegistryHandle, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::default());
        let handle = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine) as SharedMediaEngine,
            settings(max_rooms),
            ActorMetrics::new(),
        );
        (handle, engine)
    }

    #[tokio::test]
    async fn test_create_and_get_room() {
        let (handle, engine) = registry(10);

        handle.create_room("room-1".to_string()).await.unwrap();
        let room = handle.get_room("room-1".to_string()).await.unwrap();

        assert_eq!(room.room_id(), "room-1");
        assert!(!room.router().rtp_capabilities.codecs.is_empty());
        assert_eq!(engine.resource_counts().await.routers, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_room_rejected() {
        let (handle, engine) = registry(10);

        handle.create_room("room-1".to_string()).await.unwrap();
        let result = handle.create_room("room-1".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomAlreadyExists(_))));
        assert_eq!(engine.resource_counts().await.routers, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_room() {
        let (handle, engine) = registry(10);

        let (a, b) = tokio::join!(
            handle.create_room("race".to_string()),
            handle.create_room("race".to_string())
        );

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(
            matches!(a, Err(SfuError::RoomAlreadyExists(_)))
                || matches!(b, Err(SfuError::RoomAlreadyExists(_)))
        );
        assert_eq!(engine.resource_counts().await.routers, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_get_unknown_room() {
        let (handle, _engine) = registry(10);
        let result = handle.get_room("missing".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let (handle, _engine) = registry(1);
        handle.create_room("a".to_string()).await.unwrap();
        let result = handle.create_room("b".to_string()).await;
        assert!(matches!(result, Err(SfuError::CapacityExceeded)));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_room_releases_router() {
        let (handle, engine) = registry(10);
        handle.create_room("room-1".to_string()).await.unwrap();

        handle.close_room("room-1".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.list_rooms().await.unwrap().is_empty());
        assert_eq!(engine.resource_counts().await.routers, 0);

        // A fresh room can reuse the ID.
        handle.create_room("room-1".to_string()).await.unwrap();
        assert_eq!(handle.list_rooms().await.unwrap(), vec!["room-1"]);

        let result = handle.close_room("unknown".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_list_rooms_sorted() {
        let (handle, _engine) = registry(10);
        for room_id in ["c", "a", "b"] {
            handle.create_room(room_id.to_string()).await.unwrap();
        }
        assert_eq!(handle.list_rooms().await.unwrap(), vec!["a", "b", "c"]);

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.room_count, 3);
        assert_eq!(status.allocating_count, 0);
        assert!(!status.is_draining);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_all_routers() {
        let (handle, engine) = registry(10);
        handle.create_room("a".to_string()).await.unwrap();
        handle.create_room("b".to_string()).await.unwrap();

        handle.shutdown().await.unwrap();

        assert!(handle.is_cancelled());
        assert_eq!(engine.resource_counts().await.routers, 0);
        assert!(handle.create_room("c".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_token_propagates() {
        let (handle, _engine) = registry(10);
        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
