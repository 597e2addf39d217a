//! Negotiation fixtures matching the loopback engine's router codecs.

use serde_json::{json, Map, Value};
use sfu_controller::media::{
    default_media_codecs, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters,
};

/// Client-side DTLS parameters with a fixed fingerprint.
#[must_use]
pub fn client_dtls() -> DtlsParameters {
    client_dtls_with_fingerprint("AB:CD:EF:01:23:45:67:89")
}

/// Client-side DTLS parameters with the given fingerprint value.
#[must_use]
pub fn client_dtls_with_fingerprint(value: &str) -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: value.to_string(),
        }],
    }
}

/// Opus send parameters.
#[must_use]
pub fn opus_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({"ssrc": 11_111_111})],
        rtcp: Some(json!({"cname": "test"})),
    }
}

/// VP8 send parameters.
#[must_use]
pub fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }],
        header_extensions: Vec::new(),
        encodings: vec![json!({"ssrc": 22_222_222})],
        rtcp: Some(json!({"cname": "test"})),
    }
}

/// Send parameters for a track of `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}

/// Receive capabilities of a device supporting every router codec.
#[must_use]
pub fn device_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
        header_extensions: Vec::new(),
    }
}

/// Receive capabilities of a device that only decodes audio.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs()
            .into_iter()
            .filter(|codec| codec.kind == MediaKind::Audio)
            .collect(),
        header_extensions: Vec::new(),
    }
}

/// Receive capabilities that match nothing the router offers.
#[must_use]
pub fn incompatible_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/AV1".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(45),
            parameters: Map::new(),
        }],
        header_extensions: Vec::new(),
    }
}

/// Free-form application data attached to a produce request.
#[must_use]
pub fn app_data(label: &str) -> Value {
    json!({ "label": label })
}
