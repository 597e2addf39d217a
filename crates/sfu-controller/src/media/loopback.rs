//! In-process media engine.
//!
//! `LoopbackEngine` keeps the full router/transport/producer/consumer object
//! graph in memory and produces negotiation data with the same shapes a real
//! SFU worker returns (ICE credentials, host candidates on the announced IP,
//! SHA-256 DTLS fingerprints). No packets are forwarded.
//!
//! Closing an object closes everything it owns: routers own transports,
//! send transports own producers, receive transports own consumers, and a
//! producer's consumers close with it.

use super::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDirection,
};
use super::{
    ConsumerId, ConsumerInfo, EngineError, EngineHandle, MediaEngine, ProducerId, RouterId,
    RouterInfo, TransportId, TransportInfo,
};
use async_trait::async_trait;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

/// ICE candidate priority for host UDP candidates.
const HOST_CANDIDATE_PRIORITY: u32 = 1_076_302_079;

/// First dynamic payload type assigned to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Loopback engine settings.
#[derive(Debug, Clone)]
pub struct LoopbackSettings {
    /// IP advertised in ICE candidates.
    pub announced_ip: String,
    /// Lowest port handed out to transports.
    pub min_port: u16,
    /// Highest port handed out to transports.
    pub max_port: u16,
    /// Codecs every router supports.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            min_port: 40000,
            max_port: 49999,
            media_codecs: default_media_codecs(),
        }
    }
}

/// Router codecs: Opus 48 kHz stereo, VP8 and H264 at 90 kHz.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut h264_parameters = Map::new();
    h264_parameters.insert("packetization-mode".to_string(), Value::from(1));
    h264_parameters.insert(
        "profile-level-id".to_string(),
        Value::from("42e01f".to_string()),
    );
    h264_parameters.insert("level-asymmetry-allowed".to_string(), Value::from(1));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: None,
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: None,
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: None,
            parameters: h264_parameters,
        },
    ]
}

/// Live object counts, used to check that teardown leaks nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct RouterEntry {
    rtp_capabilities: RtpCapabilities,
    transports: HashSet<TransportId>,
}

struct TransportEntry {
    router: RouterId,
    direction: TransportDirection,
    remote_dtls: Option<DtlsParameters>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct ProducerEntry {
    transport: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerEntry {
    transport: TransportId,
    producer: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct LoopbackState {
    routers: HashMap<RouterId, RouterEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    next_port: Option<u16>,
    next_mid: u64,
}

impl LoopbackState {
    fn close_router(&mut self, id: &RouterId) {
        if let Some(router) = self.routers.remove(id) {
            for transport in router.transports {
                self.close_transport(&transport);
            }
        }
    }

    fn close_transport(&mut self, id: &TransportId) {
        if let Some(transport) = self.transports.remove(id) {
            for producer in transport.producers {
                self.close_producer(&producer);
            }
            for consumer in transport.consumers {
                self.close_consumer(&consumer);
            }
            if let Some(router) = self.routers.get_mut(&transport.router) {
                router.transports.remove(id);
            }
        }
    }

    fn close_producer(&mut self, id: &ProducerId) {
        if let Some(producer) = self.producers.remove(id) {
            for consumer in producer.consumers {
                self.close_consumer(&consumer);
            }
            if let Some(transport) = self.transports.get_mut(&producer.transport) {
                transport.producers.remove(id);
            }
        }
    }

    fn close_consumer(&mut self, id: &ConsumerId) {
        if let Some(consumer) = self.consumers.remove(id) {
            if let Some(transport) = self.transports.get_mut(&consumer.transport) {
                transport.consumers.remove(id);
            }
            if let Some(producer) = self.producers.get_mut(&consumer.producer) {
                producer.consumers.remove(id);
            }
        }
    }

    fn allocate_port(&mut self, min_port: u16, max_port: u16) -> u16 {
        let port = self.next_port.unwrap_or(min_port);
        self.next_port = Some(if port >= max_port { min_port } else { port + 1 });
        port
    }
}

/// In-process [`MediaEngine`] implementation.
pub struct LoopbackEngine {
    settings: LoopbackSettings,
    rng: SystemRandom,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(settings: LoopbackSettings) -> Self {
        Self {
            settings,
            rng: SystemRandom::new(),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Count live engine objects.
    pub async fn resource_counts(&self) -> ResourceCounts {
        let state = self.state.lock().await;
        ResourceCounts {
            routers: state.routers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    /// Whether a consumer exists and is paused.
    pub async fn is_consumer_paused(&self, consumer: &ConsumerId) -> Option<bool> {
        let state = self.state.lock().await;
        state.consumers.get(consumer).map(|entry| entry.paused)
    }

    fn random_hex(&self, len: usize) -> Result<String, EngineError> {
        let mut bytes = vec![0u8; len];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| EngineError::Unavailable("entropy source failed".to_string()))?;
        Ok(hex::encode(bytes))
    }

    fn router_capabilities(&self) -> RtpCapabilities {
        let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = self
            .settings
            .media_codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackSettings::default())
    }
}

/// Colon-separated upper-case SHA-256 fingerprint, as carried in SDP.
fn sha256_fingerprint(material: &[u8]) -> String {
    digest::digest(&digest::SHA256, material)
        .as_ref()
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self) -> Result<RouterInfo, EngineError> {
        let id = RouterId::generate();
        let rtp_capabilities = self.router_capabilities();

        let mut state = self.state.lock().await;
        state.routers.insert(
            id.clone(),
            RouterEntry {
                rtp_capabilities: rtp_capabilities.clone(),
                transports: HashSet::new(),
            },
        );

        debug!(target: "sfu.media.loopback", router_id = %id, "Router created");
        Ok(RouterInfo {
            id,
            rtp_capabilities,
        })
    }

    async fn create_transport(
        &self,
        router: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        let username_fragment = self.random_hex(8)?;
        let password = self.random_hex(16)?;
        let id = TransportId::generate();

        let mut state = self.state.lock().await;
        let port = state.allocate_port(self.settings.min_port, self.settings.max_port);
        let router_entry = state
            .routers
            .get_mut(router)
            .ok_or_else(|| EngineError::not_found("router", router))?;
        router_entry.transports.insert(id.clone());

        state.transports.insert(
            id.clone(),
            TransportEntry {
                router: router.clone(),
                direction,
                remote_dtls: None,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );

        debug!(
            target: "sfu.media.loopback",
            router_id = %router,
            transport_id = %id,
            direction = %direction,
            port = port,
            "Transport created"
        );

        Ok(TransportInfo {
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: sha256_fingerprint(id.as_str().as_bytes()),
                }],
            },
            ice_parameters: IceParameters {
                username_fragment,
                password,
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                ip: self.settings.announced_ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected(
                "DTLS parameters carry no fingerprints".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let entry = state
            .transports
            .get_mut(transport)
            .ok_or_else(|| EngineError::not_found("transport", transport))?;

        match &entry.remote_dtls {
            Some(existing) if existing == dtls_parameters => Ok(()),
            Some(_) => Err(EngineError::Rejected(
                "transport already connected with different DTLS parameters".to_string(),
            )),
            None => {
                entry.remote_dtls = Some(dtls_parameters.clone());
                debug!(target: "sfu.media.loopback", transport_id = %transport, "Transport connected");
                Ok(())
            }
        }
    }

    async fn create_producer(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        _app_data: &Value,
    ) -> Result<ProducerId, EngineError> {
        let mut state = self.state.lock().await;
        let (router, direction) = state
            .transports
            .get(transport)
            .map(|entry| (entry.router.clone(), entry.direction))
            .ok_or_else(|| EngineError::not_found("transport", transport))?;

        if direction != TransportDirection::Send {
            return Err(EngineError::Rejected(
                "cannot produce on a receive transport".to_string(),
            ));
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Rejected(
                "RTP parameters carry no codecs".to_string(),
            ));
        }

        let router_caps = state
            .routers
            .get(&router)
            .map(|entry| &entry.rtp_capabilities)
            .ok_or_else(|| EngineError::not_found("router", &router))?;
        let unsupported = rtp_parameters
            .codecs
            .iter()
            .find(|codec| !router_caps.supports(codec));
        if let Some(codec) = unsupported {
            return Err(EngineError::Rejected(format!(
                "unsupported codec {}",
                codec.mime_type
            )));
        }

        let id = ProducerId::generate();
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport: transport.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
                consumers: HashSet::new(),
            },
        );
        if let Some(entry) = state.transports.get_mut(transport) {
            entry.producers.insert(id.clone());
        }

        debug!(
            target: "sfu.media.loopback",
            transport_id = %transport,
            producer_id = %id,
            kind = %kind,
            "Producer created"
        );
        Ok(id)
    }

    async fn create_consumer(
        &self,
        transport: &TransportId,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        let mut state = self.state.lock().await;
        let direction = state
            .transports
            .get(transport)
            .map(|entry| entry.direction)
            .ok_or_else(|| EngineError::not_found("transport", transport))?;
        if direction != TransportDirection::Recv {
            return Err(EngineError::Rejected(
                "cannot consume on a send transport".to_string(),
            ));
        }

        let producer_entry = state
            .producers
            .get(producer)
            .ok_or_else(|| EngineError::not_found("producer", producer))?;
        let kind = producer_entry.kind;
        let codecs: Vec<_> = producer_entry
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| rtp_capabilities.supports(codec))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(EngineError::Rejected(
                "no codec in common with receiver".to_string(),
            ));
        }
        let encodings = producer_entry.rtp_parameters.encodings.clone();
        let rtcp = producer_entry.rtp_parameters.rtcp.clone();

        let mid = state.next_mid;
        state.next_mid += 1;

        let id = ConsumerId::generate();
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport: transport.clone(),
                producer: producer.clone(),
                paused,
            },
        );
        if let Some(entry) = state.producers.get_mut(producer) {
            entry.consumers.insert(id.clone());
        }
        if let Some(entry) = state.transports.get_mut(transport) {
            entry.consumers.insert(id.clone());
        }

        debug!(
            target: "sfu.media.loopback",
            transport_id = %transport,
            producer_id = %producer,
            consumer_id = %id,
            paused = paused,
            "Consumer created"
        );

        Ok(ConsumerInfo {
            id,
            producer_id: producer.clone(),
            kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                header_extensions: Vec::new(),
                encodings,
                rtcp,
            },
            paused,
        })
    }

    async fn resume_consumer(&self, consumer: &ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let entry = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| EngineError::not_found("consumer", consumer))?;
        entry.paused = false;
        Ok(())
    }

    async fn can_consume(
        &self,
        producer: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let state = self.state.lock().await;
        let entry = state
            .producers
            .get(producer)
            .ok_or_else(|| EngineError::not_found("producer", producer))?;
        Ok(entry
            .rtp_parameters
            .codecs
            .iter()
            .any(|codec| rtp_capabilities.supports(codec)))
    }

    async fn close(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        match &handle {
            EngineHandle::Router(id) => state.close_router(id),
            EngineHandle::Transport(id) => state.close_transport(id),
            EngineHandle::Producer(id) => state.close_producer(id),
            EngineHandle::Consumer(id) => state.close_consumer(id),
        }
        debug!(
            target: "sfu.media.loopback",
            kind = handle.kind(),
            id = handle.id(),
            "Engine object closed"
        );
        Ok(())
    }
}
