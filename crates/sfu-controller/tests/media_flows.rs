//! Integration tests for transport negotiation, producing and consuming.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::time::Duration;

use sfu_controller::actors::session::NegotiationState;
use sfu_controller::media::{
    EngineHandle, MediaEngine, MediaKind, RtpCapabilities, TransportDirection,
};
use sfu_controller::signaling::{ClientRequest, ServerMessage};
use sfu_test_utils::{
    client_dtls, client_dtls_with_fingerprint, device_capabilities, error_code,
    incompatible_capabilities, of_type, EngineCall, TestClient, TestSfu, TestSfuSettings,
};

/// A joined and fully connected publisher of `kind`.
async fn publisher(sfu: &TestSfu, room_id: &str, peer_id: &str, kind: MediaKind) -> TestClient {
    let mut client = sfu.client(&format!("conn-{peer_id}"));
    client.join(room_id, peer_id).await.unwrap();
    client.connect_both().await.unwrap();
    client.produce(kind).await.unwrap();
    client
}

#[tokio::test]
async fn test_produce_then_consume_video() {
    let sfu = TestSfu::new();
    let mut a = sfu.client("conn-a");
    a.create_room("R1").await.unwrap();
    a.join("R1", "A").await.unwrap();
    a.connect_both().await.unwrap();
    let producer_id = a.produce(MediaKind::Video).await.unwrap();

    let mut b = sfu.client("conn-b");
    let peers = b
        .join_with("R1", "B", RtpCapabilities::default())
        .await
        .unwrap();
    assert_eq!(peers, vec!["A"]);
    let messages = b.drain().await.unwrap();
    assert!(matches!(
        messages.as_slice(),
        [ServerMessage::NewPeer { peer_id }] if peer_id == "A"
    ));

    b.connect_transport(TransportDirection::Recv).await.unwrap();
    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "A".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: None,
        })
        .await
        .unwrap();

    match response {
        ServerMessage::Consumed {
            peer_id,
            producer_id: consumed_producer,
            kind,
            rtp_parameters,
            paused,
            ..
        } => {
            assert_eq!(peer_id, "A");
            assert_eq!(consumed_producer, producer_id);
            assert_eq!(kind, MediaKind::Video);
            assert_eq!(rtp_parameters.codecs[0].mime_type, "video/VP8");
            assert!(paused);
        }
        other => panic!("expected consumed, got {other:?}"),
    }

    let snapshot = b.snapshot().await.unwrap();
    assert_eq!(snapshot.consumer_count, 1);
    assert_eq!(sfu.engine.loopback().resource_counts().await.consumers, 1);
}

#[tokio::test]
async fn test_consume_is_idempotent_per_peer_and_kind() {
    let sfu = TestSfu::new();
    let mut creator = sfu.client("conn-creator");
    creator.create_room("idem").await.unwrap();
    let _a = publisher(&sfu, "idem", "a", MediaKind::Audio).await;

    let mut b = sfu.client("conn-b");
    b.join_with("idem", "b", RtpCapabilities::default())
        .await
        .unwrap();
    b.connect_both().await.unwrap();

    // Without declared capabilities there is nothing to match against.
    let first = b.consume("a", MediaKind::Audio).await;
    assert!(first.is_err());

    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "a".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: Some(MediaKind::Audio),
        })
        .await
        .unwrap();
    let ServerMessage::Consumed { consumer_id, .. } = response else {
        panic!("expected consumed, got {response:?}");
    };

    // Capabilities are remembered; the repeat returns the same consumer.
    let again = b.consume("a", MediaKind::Audio).await.unwrap();
    assert_eq!(again, consumer_id);
    assert_eq!(sfu.engine.calls(EngineCall::CreateConsumer), 1);
}

#[tokio::test]
async fn test_incompatible_capabilities_create_no_consumer() {
    let sfu = TestSfu::new();
    let mut creator = sfu.client("conn-creator");
    creator.create_room("codecs").await.unwrap();
    let _a = publisher(&sfu, "codecs", "a", MediaKind::Video).await;

    let mut b = sfu.client("conn-b");
    b.join_with("codecs", "b", RtpCapabilities::default())
        .await
        .unwrap();
    b.connect_transport(TransportDirection::Recv).await.unwrap();

    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "a".to_string(),
            rtp_capabilities: incompatible_capabilities(),
            kind: Some(MediaKind::Video),
        })
        .await
        .unwrap();

    assert_eq!(
        error_code(&response),
        Some(("INCOMPATIBLE_CAPABILITIES", "consume"))
    );
    assert_eq!(b.snapshot().await.unwrap().consumer_count, 0);
    assert_eq!(sfu.engine.calls(EngineCall::CreateConsumer), 0);
    assert_eq!(sfu.engine.loopback().resource_counts().await.consumers, 0);
}

#[tokio::test]
async fn test_engine_refusing_consumption_creates_no_consumer() {
    let sfu = TestSfu::new();
    let mut creator = sfu.client("conn-creator");
    creator.create_room("refused").await.unwrap();
    let _a = publisher(&sfu, "refused", "a", MediaKind::Audio).await;
    sfu.engine.refuse_consumption();

    // Server-issued consume at flush reports the failure as an error event.
    let mut b = sfu.client("conn-b");
    b.join("refused", "b").await.unwrap();
    b.connect_both().await.unwrap();
    let messages = b.drain().await.unwrap();

    let errors = of_type(&messages, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        error_code(errors[0]),
        Some(("INCOMPATIBLE_CAPABILITIES", "consume"))
    );
    assert_eq!(errors[0].request_id(), None);
    assert_eq!(b.snapshot().await.unwrap().consumer_count, 0);
    assert_eq!(sfu.engine.calls(EngineCall::CreateConsumer), 0);
}

#[tokio::test]
async fn test_transport_connect_is_idempotent() {
    let sfu = TestSfu::new();
    let mut client = sfu.client("conn-1");
    client.create_room("dtls").await.unwrap();
    client.join("dtls", "alice").await.unwrap();

    client
        .connect_transport(TransportDirection::Send)
        .await
        .unwrap();
    client
        .connect_transport(TransportDirection::Send)
        .await
        .unwrap();
    assert_eq!(sfu.engine.calls(EngineCall::ConnectTransport), 1);

    let response = client
        .request(ClientRequest::TransportConnect {
            direction: TransportDirection::Send,
            dtls_parameters: client_dtls_with_fingerprint("00:11:22"),
        })
        .await
        .unwrap();
    assert_eq!(
        error_code(&response),
        Some(("TRANSPORT_CONNECT_FAILED", "transportConnect"))
    );

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.send_transport, Some(NegotiationState::Connected));
    assert_eq!(snapshot.recv_transport, Some(NegotiationState::Created));
}

#[tokio::test]
async fn test_produce_requires_connected_send_transport() {
    let sfu = TestSfu::new();
    let mut client = sfu.client("conn-1");
    client.create_room("early").await.unwrap();
    client.join("early", "alice").await.unwrap();
    client
        .connect_transport(TransportDirection::Recv)
        .await
        .unwrap();

    let response = client
        .request(ClientRequest::Produce {
            kind: MediaKind::Audio,
            rtp_parameters: sfu_test_utils::opus_parameters(),
            app_data: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(error_code(&response), Some(("INVALID_STATE", "produce")));
    assert_eq!(sfu.engine.calls(EngineCall::CreateProducer), 0);

    // Connecting the send leg makes the same request succeed.
    client
        .connect_transport(TransportDirection::Send)
        .await
        .unwrap();
    client.produce(MediaKind::Audio).await.unwrap();
}

#[tokio::test]
async fn test_consume_own_media_is_rejected() {
    let sfu = TestSfu::new();
    let mut client = sfu.client("conn-1");
    client.create_room("mirror").await.unwrap();
    client.join("mirror", "alice").await.unwrap();
    client.connect_both().await.unwrap();
    client.produce(MediaKind::Video).await.unwrap();

    let response = client
        .request(ClientRequest::Consume {
            target_peer_id: "alice".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: None,
        })
        .await
        .unwrap();
    assert_eq!(error_code(&response), Some(("INVALID_MESSAGE", "consume")));
}

#[tokio::test]
async fn test_consume_missing_kind_fails() {
    let sfu = TestSfu::new();
    let mut creator = sfu.client("conn-creator");
    creator.create_room("audio-only").await.unwrap();
    let _a = publisher(&sfu, "audio-only", "a", MediaKind::Audio).await;

    let mut b = sfu.client("conn-b");
    b.join_with("audio-only", "b", RtpCapabilities::default())
        .await
        .unwrap();
    b.connect_transport(TransportDirection::Recv).await.unwrap();

    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "a".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: Some(MediaKind::Video),
        })
        .await
        .unwrap();
    assert_eq!(error_code(&response), Some(("CONSUME_FAILED", "consume")));
}

#[tokio::test]
async fn test_resume_consumer() {
    let sfu = TestSfu::new();
    let mut creator = sfu.client("conn-creator");
    creator.create_room("resume").await.unwrap();
    let _a = publisher(&sfu, "resume", "a", MediaKind::Video).await;

    let mut b = sfu.client("conn-b");
    b.join("resume", "b").await.unwrap();
    b.connect_both().await.unwrap();
    let consumer_id = b.consume("a", MediaKind::Video).await.unwrap();
    assert_eq!(
        sfu.engine.loopback().is_consumer_paused(&consumer_id).await,
        Some(true)
    );

    for _ in 0..2 {
        let response = b
            .request(ClientRequest::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            ServerMessage::ConsumerResumed { consumer_id: ref resumed, .. } if *resumed == consumer_id
        ));
    }

    assert_eq!(
        sfu.engine.loopback().is_consumer_paused(&consumer_id).await,
        Some(false)
    );
    assert_eq!(sfu.engine.calls(EngineCall::ResumeConsumer), 1);
}

#[tokio::test]
async fn test_consumers_can_start_unpaused() {
    let sfu = TestSfu::with_settings(TestSfuSettings {
        consumers_start_paused: false,
        ..TestSfuSettings::default()
    });
    let mut creator = sfu.client("conn-creator");
    creator.create_room("flowing").await.unwrap();
    let _a = publisher(&sfu, "flowing", "a", MediaKind::Audio).await;

    let mut b = sfu.client("conn-b");
    b.join("flowing", "b").await.unwrap();
    b.connect_both().await.unwrap();
    let messages = b.drain().await.unwrap();

    assert!(matches!(
        of_type(&messages, "newConsumer").as_slice(),
        [ServerMessage::NewConsumer { paused: false, .. }]
    ));
}

#[tokio::test]
async fn test_close_producer_closes_remote_consumers() {
    let sfu = TestSfu::new();
    let mut a = sfu.client("conn-a");
    a.create_room("closing").await.unwrap();
    a.join("closing", "a").await.unwrap();
    a.connect_both().await.unwrap();
    let producer_id = a.produce(MediaKind::Video).await.unwrap();

    let mut b = sfu.client("conn-b");
    b.join("closing", "b").await.unwrap();
    b.connect_both().await.unwrap();
    let consumer_id = b.consume("a", MediaKind::Video).await.unwrap();
    b.drain().await.unwrap();

    let response = a
        .request(ClientRequest::CloseProducer {
            producer_id: producer_id.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(
        response,
        ServerMessage::ProducerClosed { producer_id: ref closed, .. } if *closed == producer_id
    ));

    let messages = b.drain().await.unwrap();
    assert!(matches!(
        messages.as_slice(),
        [ServerMessage::ConsumerClosed { peer_id, consumer_id: closed }]
            if peer_id == "a" && *closed == consumer_id
    ));
    assert_eq!(b.snapshot().await.unwrap().consumer_count, 0);
    assert_eq!(a.snapshot().await.unwrap().producer_count, 0);

    let counts = sfu.engine.loopback().resource_counts().await;
    assert_eq!(counts.producers, 0);
    assert_eq!(counts.consumers, 0);

    // Handles of the closed consumer and producer are stale now.
    let response = b
        .request(ClientRequest::ResumeConsumer { consumer_id })
        .await
        .unwrap();
    assert_eq!(
        error_code(&response),
        Some(("STALE_REFERENCE", "resumeConsumer"))
    );
    let response = a
        .request(ClientRequest::CloseProducer { producer_id })
        .await
        .unwrap();
    assert_eq!(
        error_code(&response),
        Some(("STALE_REFERENCE", "closeProducer"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_engine_timeout_surfaces_as_engine_unavailable() {
    let sfu = TestSfu::with_settings(TestSfuSettings {
        request_timeout: Duration::from_secs(2),
        ..TestSfuSettings::default()
    });
    let mut client = sfu.client("conn-1");
    client.create_room("slow").await.unwrap();
    client.join("slow", "alice").await.unwrap();

    sfu.engine.hang(EngineCall::ConnectTransport);
    let response = client
        .request(ClientRequest::TransportConnect {
            direction: TransportDirection::Recv,
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    assert_eq!(
        error_code(&response),
        Some(("ENGINE_UNAVAILABLE", "transportConnect"))
    );

    // The transport is back in its last stable state and can be retried.
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.recv_transport, Some(NegotiationState::Created));

    sfu.engine.clear();
    client
        .connect_transport(TransportDirection::Recv)
        .await
        .unwrap();
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.recv_transport, Some(NegotiationState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_engine_call_discards_result() {
    let sfu = TestSfu::new();
    let mut client = sfu.client("conn-1");
    client.create_room("abandon").await.unwrap();
    client.join("abandon", "alice").await.unwrap();

    sfu.engine.hang(EngineCall::ConnectTransport);
    client
        .send(ClientRequest::TransportConnect {
            direction: TransportDirection::Send,
            dtls_parameters: client_dtls(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    sfu.engine.clear();
    client.disconnect().await.unwrap();

    assert!(sfu.rooms().await.is_empty());
    let counts = sfu.engine.loopback().resource_counts().await;
    assert_eq!(counts.transports, 0);
    assert_eq!(counts.routers, 0);
}

#[tokio::test]
async fn test_consume_of_closed_but_listed_producer_fails() {
    let sfu = TestSfu::new();
    let mut a = sfu.client("conn-a");
    a.create_room("gone").await.unwrap();
    a.join("gone", "a").await.unwrap();
    a.connect_both().await.unwrap();
    let producer_id = a.produce(MediaKind::Video).await.unwrap();

    // The engine drops the producer while the room directory still lists it.
    sfu.engine
        .loopback()
        .close(EngineHandle::Producer(producer_id))
        .await
        .unwrap();

    let mut b = sfu.client("conn-b");
    b.join_with("gone", "b", RtpCapabilities::default())
        .await
        .unwrap();
    b.connect_transport(TransportDirection::Recv).await.unwrap();

    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "a".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: Some(MediaKind::Video),
        })
        .await
        .unwrap();
    assert_eq!(error_code(&response), Some(("CONSUME_FAILED", "consume")));
    assert_eq!(b.snapshot().await.unwrap().consumer_count, 0);
    assert_eq!(sfu.engine.calls(EngineCall::CreateConsumer), 0);
}

#[tokio::test]
async fn test_flush_of_closed_producer_reports_consume_failed() {
    let sfu = TestSfu::new();
    let mut a = sfu.client("conn-a");
    a.create_room("flush-gone").await.unwrap();
    a.join("flush-gone", "a").await.unwrap();
    a.connect_both().await.unwrap();
    let producer_id = a.produce(MediaKind::Audio).await.unwrap();

    let mut b = sfu.client("conn-b");
    b.join("flush-gone", "b").await.unwrap();
    assert_eq!(b.snapshot().await.unwrap().pending_peers, vec!["a"]);

    sfu.engine
        .loopback()
        .close(EngineHandle::Producer(producer_id))
        .await
        .unwrap();

    b.connect_both().await.unwrap();
    let messages = b.drain().await.unwrap();
    let errors = of_type(&messages, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(error_code(errors[0]), Some(("CONSUME_FAILED", "consume")));
    assert!(of_type(&messages, "newConsumer").is_empty());
}

#[tokio::test]
async fn test_close_producer_withdraws_before_engine_release() {
    let sfu = TestSfu::with_settings(TestSfuSettings {
        request_timeout: Duration::from_secs(30),
        ..TestSfuSettings::default()
    });
    let mut a = sfu.client("conn-a");
    a.create_room("withdraw").await.unwrap();
    a.join("withdraw", "a").await.unwrap();
    a.connect_both().await.unwrap();
    let producer_id = a.produce(MediaKind::Video).await.unwrap();

    let mut b = sfu.client("conn-b");
    b.join_with("withdraw", "b", RtpCapabilities::default())
        .await
        .unwrap();
    b.connect_transport(TransportDirection::Recv).await.unwrap();

    sfu.engine.hang(EngineCall::Close);
    a.send(ClientRequest::CloseProducer { producer_id })
        .await
        .unwrap();

    // The directory entry goes away while the engine release is still stuck.
    let room = sfu.registry.get_room("withdraw".to_string()).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while room.get_state().await.unwrap().producer_count > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "producer still listed while its release is pending"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = b
        .request(ClientRequest::Consume {
            target_peer_id: "a".to_string(),
            rtp_capabilities: device_capabilities(),
            kind: Some(MediaKind::Video),
        })
        .await
        .unwrap();
    assert_eq!(error_code(&response), Some(("CONSUME_FAILED", "consume")));
}
