//! SFU controller error types.
//!
//! Every failure that reaches a client is reported as an `error` event carrying
//! the failing operation, a stable error code and a client-safe message.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::EngineError;
use std::fmt;
use thiserror::Error;

/// Signaling operations, used to label error events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateRoom,
    JoinRoom,
    TransportConnect,
    Produce,
    Consume,
    ResumeConsumer,
    CloseProducer,
    Teardown,
}

impl Operation {
    /// Returns the operation name as it appears on the wire and in metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateRoom => "createRoom",
            Operation::JoinRoom => "joinRoom",
            Operation::TransportConnect => "transportConnect",
            Operation::Produce => "produce",
            Operation::Consume => "consume",
            Operation::ResumeConsumer => "resumeConsumer",
            Operation::CloseProducer => "closeProducer",
            Operation::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SFU controller error type.
///
/// Maps to signaling error codes:
/// - `RoomNotFound`: `ROOM_NOT_FOUND`
/// - `RoomAlreadyExists`, `PeerAlreadyJoined`: conflict codes
/// - Engine-call failures: one code per failing step
/// - `EngineUnavailable`: media engine timed out or is unreachable
/// - `Config`, `Internal`: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum SfuError {
    /// Room ID is not present in the registry (or the room is closing).
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// A room with this ID already exists (or is being allocated).
    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    /// The engine could not create a transport for a joining peer.
    #[error("Transport creation failed: {0}")]
    TransportCreationFailed(String),

    /// The engine rejected the DTLS parameters of a transport.
    #[error("Transport connect failed: {0}")]
    TransportConnectFailed(String),

    /// The engine rejected a produce request.
    #[error("Produce failed: {0}")]
    ProduceFailed(String),

    /// The consumer's declared capabilities cannot receive the producer.
    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    /// Consumer creation failed for a reason other than capabilities.
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Operation on a handle whose owning session or room is already gone.
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// The media engine timed out or is unreachable.
    #[error("Media engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The peer ID is already a member of the room.
    #[error("Peer already joined: {0}")]
    PeerAlreadyJoined(String),

    /// The room has reached its peer limit.
    #[error("Room at capacity: {0}")]
    RoomFull(String),

    /// The registry has reached its room limit.
    #[error("Room capacity exceeded")]
    CapacityExceeded,

    /// Request is not valid in the session's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Request could not be parsed or is missing required fields.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The controller is shutting down.
    #[error("SFU is draining")]
    Draining,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Map an engine failure for the given operation.
    ///
    /// `EngineError::Unavailable` always becomes `EngineUnavailable`; every
    /// other engine failure becomes the error kind owned by the operation.
    #[must_use]
    pub fn from_engine(operation: Operation, error: EngineError) -> Self {
        if let EngineError::Unavailable(reason) = error {
            return SfuError::EngineUnavailable(reason);
        }

        let reason = error.to_string();
        match operation {
            Operation::CreateRoom => SfuError::EngineUnavailable(reason),
            Operation::JoinRoom => SfuError::TransportCreationFailed(reason),
            Operation::TransportConnect => SfuError::TransportConnectFailed(reason),
            Operation::Produce => SfuError::ProduceFailed(reason),
            Operation::Consume | Operation::ResumeConsumer => SfuError::ConsumeFailed(reason),
            Operation::CloseProducer | Operation::Teardown => SfuError::Internal(reason),
        }
    }

    /// Returns the signaling error code for this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            SfuError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            SfuError::RoomAlreadyExists(_) => "ROOM_ALREADY_EXISTS",
            SfuError::TransportCreationFailed(_) => "TRANSPORT_CREATION_FAILED",
            SfuError::TransportConnectFailed(_) => "TRANSPORT_CONNECT_FAILED",
            SfuError::ProduceFailed(_) => "PRODUCE_FAILED",
            SfuError::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            SfuError::ConsumeFailed(_) => "CONSUME_FAILED",
            SfuError::StaleReference(_) => "STALE_REFERENCE",
            SfuError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            SfuError::PeerAlreadyJoined(_) => "PEER_ALREADY_JOINED",
            SfuError::RoomFull(_) => "ROOM_FULL",
            SfuError::CapacityExceeded => "CAPACITY_EXCEEDED",
            SfuError::InvalidState(_) => "INVALID_STATE",
            SfuError::InvalidMessage(_) => "INVALID_MESSAGE",
            SfuError::Draining => "DRAINING",
            SfuError::Config(_) | SfuError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Config(_) | SfuError::Internal(_) => "An internal error occurred".to_string(),
            SfuError::EngineUnavailable(_) => "Media engine unavailable, please retry".to_string(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::RoomAlreadyExists(_) => "Room already exists".to_string(),
            SfuError::PeerAlreadyJoined(_) => "Peer already joined this room".to_string(),
            SfuError::RoomFull(_) => "Room is at capacity".to_string(),
            SfuError::CapacityExceeded => "Server is at capacity, please try again".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::StaleReference(_) => "Referenced media is no longer available".to_string(),
            SfuError::TransportCreationFailed(msg)
            | SfuError::TransportConnectFailed(msg)
            | SfuError::ProduceFailed(msg)
            | SfuError::IncompatibleCapabilities(msg)
            | SfuError::ConsumeFailed(msg)
            | SfuError::InvalidState(msg)
            | SfuError::InvalidMessage(msg) => msg.clone(),
        }
    }
}
