//! Media engine adapter.
//!
//! The signaling layer never touches media. It drives an external SFU engine
//! through the [`MediaEngine`] trait: routers per room, one send and one
//! receive transport per peer, producers for published tracks and consumers
//! for subscriptions. Engine objects are referred to by opaque string IDs.
//!
//! Every engine call may fail or time out. Callers wrap calls with a timeout
//! and map failures through [`crate::errors::SfuError::from_engine`].
//!
//! # Implementations
//!
//! - [`LoopbackEngine`] - in-process engine with real negotiation data shapes,
//!   used for local development and tests.

pub mod loopback;
pub mod types;

pub use loopback::{default_media_codecs, LoopbackEngine, LoopbackSettings, ResourceCounts};
pub use types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters, TransportDirection,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

engine_id!(
    /// Engine-side router (one per room).
    RouterId
);
engine_id!(
    /// Engine-side transport (two per joined peer).
    TransportId
);
engine_id!(
    /// Engine-side producer (one per published track).
    ProducerId
);
engine_id!(
    /// Engine-side consumer (one per subscription).
    ConsumerId
);

/// Any engine object that can be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHandle {
    Router(RouterId),
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

impl EngineHandle {
    /// Resource kind, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            EngineHandle::Router(_) => "router",
            EngineHandle::Transport(_) => "transport",
            EngineHandle::Producer(_) => "producer",
            EngineHandle::Consumer(_) => "consumer",
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            EngineHandle::Router(id) => id.as_str(),
            EngineHandle::Transport(id) => id.as_str(),
            EngineHandle::Producer(id) => id.as_str(),
            EngineHandle::Consumer(id) => id.as_str(),
        }
    }
}

/// A router allocated for a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Server-side transport parameters handed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// A consumer created on a receive transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Media engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine is unreachable or did not answer in time.
    #[error("media engine unavailable: {0}")]
    Unavailable(String),

    /// The referenced engine object does not exist (or was closed).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The engine refused the request.
    #[error("rejected by media engine: {0}")]
    Rejected(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Operations the signaling layer needs from an SFU media engine.
///
/// All calls are asynchronous and may be slow; implementations must be safe
/// to call concurrently from many connection actors.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Allocate a router for a new room.
    async fn create_router(&self) -> Result<RouterInfo, EngineError>;

    /// Create a WebRTC transport on a router.
    async fn create_transport(
        &self,
        router: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError>;

    /// Complete DTLS negotiation of a transport with the client's parameters.
    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Start receiving a track from a client on a send transport.
    async fn create_producer(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: &Value,
    ) -> Result<ProducerId, EngineError>;

    /// Forward a producer's track to a receive transport.
    async fn create_consumer(
        &self,
        transport: &TransportId,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError>;

    /// Resume a consumer that was created paused.
    async fn resume_consumer(&self, consumer: &ConsumerId) -> Result<(), EngineError>;

    /// Whether a receiver with the given capabilities can consume a producer.
    ///
    /// A producer that no longer exists is `EngineError::NotFound`, not
    /// `Ok(false)`.
    async fn can_consume(
        &self,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    /// Release an engine object and everything it owns. Unknown handles are
    /// not an error.
    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError>;
}

/// Shared engine handle passed to actors.
pub type SharedMediaEngine = Arc<dyn MediaEngine>;
