//! Signaling wire protocol.
//!
//! Messages are JSON objects discriminated by a `type` field, camelCase
//! throughout. Client requests may carry a numeric `requestId`; the matching
//! response (or `error`) echoes it. Notifications never carry one.
//!
//! ```json
//! {"requestId": 7, "type": "joinRoom", "roomId": "lobby", "peerId": "alice"}
//! {"requestId": 7, "type": "roomJoined", "roomId": "lobby", ...}
//! {"type": "newPeer", "peerId": "bob"}
//! ```

use crate::errors::{Operation, SfuError};
use crate::media::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request plus its correlation ID.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientEnvelope {
    #[must_use]
    pub fn new(request_id: u64, request: ClientRequest) -> Self {
        Self {
            request_id: Some(request_id),
            request,
        }
    }
}

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    CreateRoom {
        room_id: String,
    },
    JoinRoom {
        room_id: String,
        peer_id: String,
        /// Receive capabilities of the client device.
        ///
        /// Optional. When omitted (and until a `consume` supplies them), the
        /// server does not consume announced peers on the client's behalf:
        /// `newPeer` and `producerAvailable` are still delivered, the pending
        /// queue flush is a no-op, and the client issues `consume` itself.
        #[serde(default)]
        rtp_capabilities: RtpCapabilities,
    },
    TransportConnect {
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: Value,
    },
    Consume {
        #[serde(alias = "producerPeerId")]
        target_peer_id: String,
        #[serde(default)]
        rtp_capabilities: RtpCapabilities,
        /// Track to consume; video is preferred when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<MediaKind>,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
}

impl ClientRequest {
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            ClientRequest::CreateRoom { .. } => Operation::CreateRoom,
            ClientRequest::JoinRoom { .. } => Operation::JoinRoom,
            ClientRequest::TransportConnect { .. } => Operation::TransportConnect,
            ClientRequest::Produce { .. } => Operation::Produce,
            ClientRequest::Consume { .. } => Operation::Consume,
            ClientRequest::ResumeConsumer { .. } => Operation::ResumeConsumer,
            ClientRequest::CloseProducer { .. } => Operation::CloseProducer,
        }
    }
}

/// Responses and notifications sent to a client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // Responses
    RoomCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        room_id: String,
    },
    RoomJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        room_id: String,
        peer_id: String,
        recv_transport: TransportInfo,
        send_transport: TransportInfo,
        router_rtp_capabilities: RtpCapabilities,
        /// Peers already in the room, in arrival order.
        peers: Vec<String>,
    },
    TransportConnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        direction: TransportDirection,
    },
    Produced {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    Consumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        peer_id: String,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },
    ConsumerResumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        consumer_id: ConsumerId,
    },
    ProducerClosed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        producer_id: ProducerId,
    },

    // Notifications
    NewPeer {
        peer_id: String,
    },
    ProducerAvailable {
        peer_id: String,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    NewConsumer {
        peer_id: String,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },
    ConsumerClosed {
        peer_id: String,
        consumer_id: ConsumerId,
    },
    PeerLeft {
        peer_id: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        operation: String,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Build the `error` event for a failed operation.
    #[must_use]
    pub fn error(request_id: Option<u64>, operation: Operation, error: &SfuError) -> Self {
        ServerMessage::Error {
            request_id,
            operation: operation.as_str().to_string(),
            code: error.error_code().to_string(),
            message: error.client_message(),
        }
    }

    /// Correlation ID of a response, `None` for notifications.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::RoomCreated { request_id, .. }
            | ServerMessage::RoomJoined { request_id, .. }
            | ServerMessage::TransportConnected { request_id, .. }
            | ServerMessage::Produced { request_id, .. }
            | ServerMessage::Consumed { request_id, .. }
            | ServerMessage::ConsumerResumed { request_id, .. }
            | ServerMessage::ProducerClosed { request_id, .. }
            | ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::NewPeer { .. }
            | ServerMessage::ProducerAvailable { .. }
            | ServerMessage::NewConsumer { .. }
            | ServerMessage::ConsumerClosed { .. }
            | ServerMessage::PeerLeft { .. } => None,
        }
    }

    /// Wire `type` of the message, for logging.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated { .. } => "roomCreated",
            ServerMessage::RoomJoined { .. } => "roomJoined",
            ServerMessage::TransportConnected { .. } => "transportConnected",
            ServerMessage::Produced { .. } => "produced",
            ServerMessage::Consumed { .. } => "consumed",
            ServerMessage::ConsumerResumed { .. } => "consumerResumed",
            ServerMessage::ProducerClosed { .. } => "producerClosed",
            ServerMessage::NewPeer { .. } => "newPeer",
            ServerMessage::ProducerAvailable { .. } => "producerAvailable",
            ServerMessage::NewConsumer { .. } => "newConsumer",
            ServerMessage::ConsumerClosed { .. } => "consumerClosed",
            ServerMessage::PeerLeft { .. } => "peerLeft",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Parse a text frame into a request.
///
/// On failure, returns the `error` event to send back. The request ID and
/// operation are recovered from the raw JSON when possible.
pub fn parse_client_frame(text: &str) -> Result<ClientEnvelope, ServerMessage> {
    serde_json::from_str::<ClientEnvelope>(text).map_err(|parse_error| {
        let raw: Option<Value> = serde_json::from_str(text).ok();
        let request_id = raw
            .as_ref()
            .and_then(|v| v.get("requestId"))
            .and_then(Value::as_u64);
        let operation = raw
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let error = SfuError::InvalidMessage(format!("malformed request: {parse_error}"));

        ServerMessage::Error {
            request_id,
            operation,
            code: error.error_code().to_string(),
            message: error.client_message(),
        }
    })
}
