//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`. Rooms push
//! notifications to connections over unbounded channels so a slow connection
//! never stalls its room.

use super::room::RoomActorHandle;
use super::session::SessionSnapshot;
use crate::errors::SfuError;
use crate::media::{MediaKind, ProducerId, RouterId, RouterInfo};
use crate::signaling::protocol::ClientEnvelope;
use tokio::sync::{mpsc, oneshot};

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Reserve a room ID and allocate its router.
    CreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Router allocation for a reserved room finished (internal).
    RouterAllocated {
        room_id: String,
        result: Result<RouterInfo, SfuError>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Look up a running room.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// A room released its router and is leaving the registry.
    ///
    /// Only removes the entry if it still refers to `router_id`.
    RemoveRoom {
        room_id: String,
        router_id: RouterId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Explicit teardown of a room (e.g. one that never had a peer).
    CloseRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// IDs of running rooms, sorted.
    ListRooms {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Registry status (for health and tests).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms, cancel every room and reply once they stopped.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Add a peer to the room and announce it to everyone else.
    AddPeer {
        peer_id: String,
        notifier: mpsc::UnboundedSender<RoomNotification>,
        respond_to: oneshot::Sender<Result<JoinSnapshot, SfuError>>,
    },

    /// Remove a peer; closes the room if it was the last one.
    RemovePeer {
        peer_id: String,
        respond_to: oneshot::Sender<Result<RemovalOutcome, SfuError>>,
    },

    /// Record a new producer and announce it to the other peers.
    PublishProducer {
        peer_id: String,
        producer: ProducerInfo,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Forget a closed producer and tell the other peers.
    UnpublishProducer {
        peer_id: String,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Live producers of a peer, audio before video.
    PeerProducers {
        peer_id: String,
        respond_to: oneshot::Sender<Result<Vec<ProducerInfo>, SfuError>>,
    },

    /// Current room state (for debugging/tests).
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// A parsed client request.
    Request { envelope: ClientEnvelope },

    /// Close the connection after the requests already queued.
    Close { reason: String },

    /// Current session state (for debugging/tests).
    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

/// Notifications a room pushes to its peers' connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotification {
    NewPeer {
        peer_id: String,
    },
    ProducerAvailable {
        peer_id: String,
        producer: ProducerInfo,
    },
    ProducerClosed {
        peer_id: String,
        producer_id: ProducerId,
    },
    PeerLeft {
        peer_id: String,
    },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// A producer as seen by the room directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

/// Result of a successful `AddPeer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSnapshot {
    /// Peers that were already in the room, in arrival order.
    pub existing_peers: Vec<String>,
}

/// Result of a `RemovePeer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// The peer was the last one and the room has been removed.
    pub room_closed: bool,
}

/// Room state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub router_id: RouterId,
    /// Peers in arrival order.
    pub peers: Vec<String>,
    pub producer_count: usize,
    pub is_closing: bool,
}

/// Registry status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Rooms with a running room actor.
    pub room_count: usize,
    /// Rooms whose router allocation is still in flight.
    pub allocating_count: usize,
    pub peer_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
