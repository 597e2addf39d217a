//! In-process signaling harness.
//!
//! [`TestSfu`] wires a registry, a [`ScriptedEngine`] and the shared
//! connection context together. [`TestClient`] drives one `ConnectionActor`
//! the way the WebSocket gateway does, minus the socket: requests go in as
//! envelopes, every server message comes back on a channel.
//!
//! Responses are matched on `requestId`; anything else received while
//! waiting (notifications, unrelated errors) is kept in a backlog that
//! `drain` hands back in arrival order.

use crate::fixtures;
use crate::scripted_engine::ScriptedEngine;
use anyhow::{anyhow, bail, Context, Result};
use sfu_controller::actors::{
    ActorMetrics, ConnectionActor, ConnectionActorHandle, ConnectionContext, RegistrySettings,
    RoomRegistryHandle, RoomSettings, SessionSnapshot,
};
use sfu_controller::media::{
    ConsumerId, MediaKind, ProducerId, RtpCapabilities, SharedMediaEngine, TransportDirection,
};
use sfu_controller::signaling::{ClientEnvelope, ClientRequest, ServerMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a client waits for any single message.
///
/// Longer than the harness request timeout, so engine timeouts surface as
/// error events instead of test-side timeouts.
pub const CLIENT_WAIT: Duration = Duration::from_secs(30);

/// Harness settings.
#[derive(Debug, Clone, Copy)]
pub struct TestSfuSettings {
    pub max_rooms: usize,
    pub max_peers_per_room: usize,
    pub request_timeout: Duration,
    pub empty_room_ttl: Duration,
    pub consumers_start_paused: bool,
}

impl Default for TestSfuSettings {
    fn default() -> Self {
        Self {
            max_rooms: 100,
            max_peers_per_room: 50,
            request_timeout: Duration::from_secs(5),
            empty_room_ttl: Duration::from_secs(300),
            consumers_start_paused: true,
        }
    }
}

/// A controller with everything but the network.
pub struct TestSfu {
    pub engine: Arc<ScriptedEngine>,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    pub context: ConnectionContext,
    connections: CancellationToken,
}

impl TestSfu {
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(TestSfuSettings::default())
    }

    #[must_use]
    pub fn with_settings(settings: TestSfuSettings) -> Self {
        let engine = Arc::new(ScriptedEngine::new());
        let shared: SharedMediaEngine = engine.clone();
        let metrics = ActorMetrics::new();

        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&shared),
            RegistrySettings {
                max_rooms: settings.max_rooms,
                request_timeout: settings.request_timeout,
                room: RoomSettings {
                    max_peers: settings.max_peers_per_room,
                    empty_room_ttl: settings.empty_room_ttl,
                    request_timeout: settings.request_timeout,
                },
            },
            Arc::clone(&metrics),
        );

        let context = ConnectionContext {
            registry: registry.clone(),
            engine: shared,
            metrics: Arc::clone(&metrics),
            request_timeout: settings.request_timeout,
            consumers_start_paused: settings.consumers_start_paused,
        };

        Self {
            engine,
            registry,
            metrics,
            context,
            connections: CancellationToken::new(),
        }
    }

    /// Open a new client connection.
    #[must_use]
    pub fn client(&self, connection_id: &str) -> TestClient {
        TestClient::connect(connection_id, &self.context, self.connections.child_token())
    }

    /// Running room IDs.
    pub async fn rooms(&self) -> Vec<String> {
        self.registry.list_rooms().await.unwrap_or_default()
    }
}

impl Default for TestSfu {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestSfu {
    fn drop(&mut self) {
        self.connections.cancel();
        self.registry.cancel();
    }
}

/// One signaling client.
pub struct TestClient {
    handle: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    backlog: VecDeque<ServerMessage>,
    next_request_id: u64,
}

impl TestClient {
    /// Spawn a connection actor for a new client.
    #[must_use]
    pub fn connect(
        connection_id: &str,
        context: &ConnectionContext,
        cancel_token: CancellationToken,
    ) -> Self {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionActor::spawn(
            connection_id.to_string(),
            context.clone(),
            outbound,
            cancel_token,
        );
        Self {
            handle,
            task: Some(task),
            inbox,
            backlog: VecDeque::new(),
            next_request_id: 1,
        }
    }

    /// Send a request and wait for its response (or error event).
    pub async fn request(&mut self, request: ClientRequest) -> Result<ServerMessage> {
        let request_id = self.send(request).await?;
        self.response(request_id).await
    }

    /// Send a request without waiting. Returns its request ID.
    pub async fn send(&mut self, request: ClientRequest) -> Result<u64> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.handle
            .submit(ClientEnvelope::new(request_id, request))
            .await
            .map_err(|e| anyhow!("submit failed: {e}"))?;
        Ok(request_id)
    }

    /// Wait for the response to `request_id`.
    pub async fn response(&mut self, request_id: u64) -> Result<ServerMessage> {
        if let Some(pos) = self
            .backlog
            .iter()
            .position(|m| m.request_id() == Some(request_id))
        {
            return self
                .backlog
                .remove(pos)
                .ok_or_else(|| anyhow!("backlog changed"));
        }
        loop {
            let message = self.recv().await?;
            if message.request_id() == Some(request_id) {
                return Ok(message);
            }
            self.backlog.push_back(message);
        }
    }

    /// Next message in arrival order, backlog first.
    pub async fn next_message(&mut self) -> Result<ServerMessage> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(message);
        }
        self.recv().await
    }

    /// Wait until the actor has handled everything delivered to it so far.
    ///
    /// Room notifications are handled ahead of queued requests, so a
    /// snapshot round-trip is a barrier for both.
    pub async fn settle(&mut self) -> Result<()> {
        self.snapshot().await.map(|_| ())
    }

    /// Settle, then take every message not yet consumed.
    pub async fn drain(&mut self) -> Result<Vec<ServerMessage>> {
        self.settle().await?;
        let mut messages: Vec<_> = self.backlog.drain(..).collect();
        while let Ok(message) = self.inbox.try_recv() {
            messages.push(message);
        }
        Ok(messages)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        tokio::time::timeout(CLIENT_WAIT, self.handle.snapshot())
            .await
            .context("timed out waiting for snapshot")?
            .map_err(|e| anyhow!("snapshot failed: {e}"))
    }

    /// Drop the connection and wait for teardown to finish.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.handle.cancel();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(CLIENT_WAIT, task)
                .await
                .context("timed out waiting for teardown")?
                .context("connection actor failed")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn handle(&self) -> &ConnectionActorHandle {
        &self.handle
    }

    async fn recv(&mut self) -> Result<ServerMessage> {
        tokio::time::timeout(CLIENT_WAIT, self.inbox.recv())
            .await
            .context("timed out waiting for a server message")?
            .ok_or_else(|| anyhow!("connection closed"))
    }

    // ------------------------------------------------------------------
    // Convenience flows (fail on error events)
    // ------------------------------------------------------------------

    pub async fn create_room(&mut self, room_id: &str) -> Result<()> {
        expect_ok(
            self.request(ClientRequest::CreateRoom {
                room_id: room_id.to_string(),
            })
            .await?,
        )
        .map(|_| ())
    }

    /// Join with capabilities for every router codec. Returns the peers
    /// that were already in the room.
    pub async fn join(&mut self, room_id: &str, peer_id: &str) -> Result<Vec<String>> {
        self.join_with(room_id, peer_id, fixtures::device_capabilities())
            .await
    }

    pub async fn join_with(
        &mut self,
        room_id: &str,
        peer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Vec<String>> {
        match self
            .request(ClientRequest::JoinRoom {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                rtp_capabilities,
            })
            .await?
        {
            ServerMessage::RoomJoined { peers, .. } => Ok(peers),
            other => bail!("join failed: {other:?}"),
        }
    }

    pub async fn connect_transport(&mut self, direction: TransportDirection) -> Result<()> {
        expect_ok(
            self.request(ClientRequest::TransportConnect {
                direction,
                dtls_parameters: fixtures::client_dtls(),
            })
            .await?,
        )
        .map(|_| ())
    }

    /// Connect the send transport, then the receive transport.
    pub async fn connect_both(&mut self) -> Result<()> {
        self.connect_transport(TransportDirection::Send).await?;
        self.connect_transport(TransportDirection::Recv).await
    }

    pub async fn produce(&mut self, kind: MediaKind) -> Result<ProducerId> {
        match self
            .request(ClientRequest::Produce {
                kind,
                rtp_parameters: fixtures::rtp_parameters(kind),
                app_data: fixtures::app_data(kind.as_str()),
            })
            .await?
        {
            ServerMessage::Produced { producer_id, .. } => Ok(producer_id),
            other => bail!("produce failed: {other:?}"),
        }
    }

    pub async fn consume(&mut self, target_peer_id: &str, kind: MediaKind) -> Result<ConsumerId> {
        match self
            .request(ClientRequest::Consume {
                target_peer_id: target_peer_id.to_string(),
                rtp_capabilities: RtpCapabilities::default(),
                kind: Some(kind),
            })
            .await?
        {
            ServerMessage::Consumed { consumer_id, .. } => Ok(consumer_id),
            other => bail!("consume failed: {other:?}"),
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

fn expect_ok(message: ServerMessage) -> Result<ServerMessage> {
    match message {
        ServerMessage::Error {
            operation,
            code,
            message,
            ..
        } => bail!("{operation} failed with {code}: {message}"),
        other => Ok(other),
    }
}

/// `(code, operation)` of an error event, `None` for anything else.
#[must_use]
pub fn error_code(message: &ServerMessage) -> Option<(&str, &str)> {
    match message {
        ServerMessage::Error {
            code, operation, ..
        } => Some((code.as_str(), operation.as_str())),
        _ => None,
    }
}

/// Messages of one wire type, in order.
#[must_use]
pub fn of_type<'a>(messages: &'a [ServerMessage], type_name: &str) -> Vec<&'a ServerMessage> {
    messages
        .iter()
        .filter(|m| m.type_name() == type_name)
        .collect()
}
