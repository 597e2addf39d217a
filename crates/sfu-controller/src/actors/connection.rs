//! `ConnectionActor` - per-client signaling gateway.
//!
//! Each `ConnectionActor`:
//! - Serves exactly one signaling connection and owns its `PeerSession`
//! - Processes client requests one at a time, in arrival order
//! - Receives room notifications on a separate unbounded channel, so an
//!   announcement arriving while a request waits on the media engine is
//!   queued rather than lost
//! - Pushes responses and notifications to the client over `outbound`
//!
//! # Handshake Ordering
//!
//! Announcements (`newPeer`, `producerAvailable`) are always forwarded to the
//! client. If the receive transport is already connected, the announced
//! peer's producers are consumed immediately; otherwise the peer is queued
//! in the session's pending-consumption queue, which is flushed once, in
//! FIFO order, right after the receive transport connects.
//!
//! # Lifecycle
//!
//! Runs until the client disconnects (cancellation), a `Close` message, or
//! service shutdown. Teardown first removes the peer from its room (which
//! withdraws its producers and announces `peerLeft`), then releases
//! consumers, producers and transports through the engine; release failures
//! are logged, never surfaced. Engine calls still in flight when the connection
//! drops are abandoned and their results discarded.

use crate::errors::{Operation, SfuError};
use crate::media::{
    ConsumerId, DtlsParameters, EngineError, EngineHandle, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, SharedMediaEngine, TransportDirection,
};
use crate::observability::metrics as prom;
use crate::signaling::protocol::{ClientEnvelope, ClientRequest, ServerMessage};

use super::messages::{ConnectionMessage, ProducerInfo, RoomNotification};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;
use super::session::{Announcement, ConnectStep, ConsumerRecord, PeerSession, SessionSnapshot};

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Shared dependencies handed to every connection actor.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: RoomRegistryHandle,
    pub engine: SharedMediaEngine,
    pub metrics: Arc<ActorMetrics>,
    /// Bound on every engine call made for a request.
    pub request_timeout: Duration,
    /// Whether new consumers wait for `resumeConsumer`.
    pub consumers_start_paused: bool,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a client request.
    pub async fn submit(&self, envelope: ClientEnvelope) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Request { envelope })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Close the connection once the requests already queued are handled.
    pub async fn close(&self, reason: String) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Get the current session state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the connection actor (client went away).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Work that runs after a response has been pushed.
#[derive(Debug)]
enum FollowUp {
    /// An existing room member, announced to a peer that just joined.
    Announce(String),
    /// The receive transport just connected.
    FlushPending,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    context: ConnectionContext,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    notify_tx: mpsc::UnboundedSender<RoomNotification>,
    notify_rx: mpsc::UnboundedReceiver<RoomNotification>,
    session: PeerSession,
    /// Room joined by this connection.
    room: Option<RoomActorHandle>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Everything for the client is pushed to `outbound`. Cancelling
    /// `cancel_token` tears the session down.
    pub fn spawn(
        connection_id: String,
        context: ConnectionContext,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        cancel_token: CancellationToken,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let actor = Self {
            connection_id: connection_id.clone(),
            context,
            receiver,
            cancel_token: cancel_token.clone(),
            outbound,
            notify_tx,
            notify_rx,
            session: PeerSession::new(),
            room: None,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );
        self.context.metrics.connection_opened();

        loop {
            // Room notifications take priority over queued client requests.
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                Some(notification) = self.notify_rx.recv() => {
                    self.handle_notification(notification).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.context.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.teardown().await;
        self.context.metrics.connection_closed();

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            peer_id = ?self.session.peer_id(),
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Request { envelope } => {
                self.handle_request(envelope).await;
                false
            }

            ConnectionMessage::Close { reason } => {
                info!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Closing connection"
                );
                true
            }

            ConnectionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.session.snapshot());
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, envelope: ClientEnvelope) {
        let ClientEnvelope {
            request_id,
            request,
        } = envelope;
        let operation = request.operation();
        let started = Instant::now();
        let mut follow_ups = Vec::new();

        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            request_id = ?request_id,
            operation = %operation,
            "Handling request"
        );

        let result = match request {
            ClientRequest::CreateRoom { room_id } => self.create_room(request_id, room_id).await,
            ClientRequest::JoinRoom {
                room_id,
                peer_id,
                rtp_capabilities,
            } => {
                self.join_room(request_id, room_id, peer_id, rtp_capabilities, &mut follow_ups)
                    .await
            }
            ClientRequest::TransportConnect {
                direction,
                dtls_parameters,
            } => {
                self.transport_connect(request_id, direction, dtls_parameters, &mut follow_ups)
                    .await
            }
            ClientRequest::Produce {
                kind,
                rtp_parameters,
                app_data,
            } => {
                self.produce(request_id, kind, rtp_parameters, app_data)
                    .await
            }
            ClientRequest::Consume {
                target_peer_id,
                rtp_capabilities,
                kind,
            } => {
                self.consume(request_id, target_peer_id, rtp_capabilities, kind)
                    .await
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                self.resume_consumer(request_id, consumer_id).await
            }
            ClientRequest::CloseProducer { producer_id } => {
                self.close_producer(request_id, producer_id).await
            }
        };

        prom::record_request_latency(operation.as_str(), started.elapsed());

        match result {
            Ok(response) => self.push(response),
            Err(error) => self.push_error(request_id, operation, &error),
        }

        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Announce(peer_id) => self.on_new_peer(peer_id).await,
                FollowUp::FlushPending => self.flush_pending().await,
            }
        }
    }

    async fn create_room(
        &mut self,
        request_id: Option<u64>,
        room_id: String,
    ) -> Result<ServerMessage, SfuError> {
        self.context.registry.create_room(room_id.clone()).await?;
        Ok(ServerMessage::RoomCreated {
            request_id,
            room_id,
        })
    }

    async fn join_room(
        &mut self,
        request_id: Option<u64>,
        room_id: String,
        peer_id: String,
        rtp_capabilities: RtpCapabilities,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<ServerMessage, SfuError> {
        if room_id.is_empty() || peer_id.is_empty() {
            return Err(SfuError::InvalidMessage(
                "roomId and peerId must not be empty".to_string(),
            ));
        }
        self.session.begin_join(&room_id)?;

        let result = self
            .join_room_inner(request_id, room_id, peer_id, rtp_capabilities, follow_ups)
            .await;
        if result.is_err() {
            self.session.abort_join();
        }
        result
    }

    async fn join_room_inner(
        &mut self,
        request_id: Option<u64>,
        room_id: String,
        peer_id: String,
        rtp_capabilities: RtpCapabilities,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<ServerMessage, SfuError> {
        let room = self.context.registry.get_room(room_id.clone()).await?;
        let router_id = room.router().id.clone();
        let engine = Arc::clone(&self.context.engine);

        let recv_transport = self
            .engine_call(
                Operation::JoinRoom,
                engine.create_transport(&router_id, TransportDirection::Recv),
            )
            .await?;

        let send_transport = match self
            .engine_call(
                Operation::JoinRoom,
                engine.create_transport(&router_id, TransportDirection::Send),
            )
            .await
        {
            Ok(transport) => transport,
            Err(error) => {
                self.release(EngineHandle::Transport(recv_transport.id))
                    .await;
                return Err(error);
            }
        };

        let snapshot = match room.add_peer(peer_id.clone(), self.notify_tx.clone()).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.release(EngineHandle::Transport(send_transport.id))
                    .await;
                self.release(EngineHandle::Transport(recv_transport.id))
                    .await;
                return Err(error);
            }
        };

        self.session.complete_join(
            peer_id.clone(),
            recv_transport.id.clone(),
            send_transport.id.clone(),
            rtp_capabilities,
        )?;
        self.room = Some(room.clone());

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            room_id = %room_id,
            peer_id = %peer_id,
            existing_peers = snapshot.existing_peers.len(),
            "Peer joined room"
        );

        follow_ups.extend(
            snapshot
                .existing_peers
                .iter()
                .cloned()
                .map(FollowUp::Announce),
        );

        Ok(ServerMessage::RoomJoined {
            request_id,
            room_id,
            peer_id,
            recv_transport,
            send_transport,
            router_rtp_capabilities: room.router().rtp_capabilities.clone(),
            peers: snapshot.existing_peers,
        })
    }

    async fn transport_connect(
        &mut self,
        request_id: Option<u64>,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<ServerMessage, SfuError> {
        let transport_id = match self.session.begin_connect(direction, &dtls_parameters)? {
            ConnectStep::AlreadyConnected => {
                return Ok(ServerMessage::TransportConnected {
                    request_id,
                    direction,
                });
            }
            ConnectStep::Connect(transport_id) => transport_id,
        };

        let engine = Arc::clone(&self.context.engine);
        if let Err(error) = self
            .engine_call(
                Operation::TransportConnect,
                engine.connect_transport(&transport_id, &dtls_parameters),
            )
            .await
        {
            self.session.abort_connect(direction);
            return Err(error);
        }

        if self.session.complete_connect(direction) {
            follow_ups.push(FollowUp::FlushPending);
        }

        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            direction = %direction,
            state = self.session.state().as_str(),
            "Transport connected"
        );

        Ok(ServerMessage::TransportConnected {
            request_id,
            direction,
        })
    }

    async fn produce(
        &mut self,
        request_id: Option<u64>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ServerMessage, SfuError> {
        let transport_id = self.session.produce_transport(kind)?;
        let room = self.joined_room()?;
        let peer_id = self.joined_peer_id()?;
        let engine = Arc::clone(&self.context.engine);

        let producer_id = self
            .engine_call(
                Operation::Produce,
                engine.create_producer(&transport_id, kind, &rtp_parameters, &app_data),
            )
            .await?;

        let producer = ProducerInfo {
            producer_id: producer_id.clone(),
            kind,
        };
        if let Err(error) = room.publish_producer(peer_id, producer).await {
            self.release(EngineHandle::Producer(producer_id)).await;
            return Err(error);
        }
        self.session.record_producer(producer_id.clone(), kind);

        info!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(ServerMessage::Produced {
            request_id,
            producer_id,
            kind,
        })
    }

    async fn consume(
        &mut self,
        request_id: Option<u64>,
        target_peer_id: String,
        rtp_capabilities: RtpCapabilities,
        kind: Option<MediaKind>,
    ) -> Result<ServerMessage, SfuError> {
        if self.session.peer_id() == Some(target_peer_id.as_str()) {
            return Err(SfuError::InvalidMessage(
                "cannot consume own media".to_string(),
            ));
        }
        self.session.consume_transport()?;
        self.session.set_rtp_capabilities(rtp_capabilities);
        let room = self.joined_room()?;

        let producers = room.peer_producers(target_peer_id.clone()).await?;
        let producer = select_producer(&producers, kind).ok_or_else(|| {
            SfuError::ConsumeFailed(match kind {
                Some(kind) => format!("peer {target_peer_id} has no {kind} producer"),
                None => format!("peer {target_peer_id} has no producers"),
            })
        })?;

        if let Some(existing) = self.session.existing_consumer(&target_peer_id, producer.kind) {
            return Ok(consumed(request_id, existing));
        }

        let capabilities = self.session.rtp_capabilities().clone();
        let record = self
            .create_consumer(&target_peer_id, &producer, &capabilities)
            .await?;
        Ok(consumed(request_id, &record))
    }

    async fn resume_consumer(
        &mut self,
        request_id: Option<u64>,
        consumer_id: ConsumerId,
    ) -> Result<ServerMessage, SfuError> {
        let Some(record) = self.session.consumer(&consumer_id) else {
            return Err(SfuError::StaleReference(format!(
                "unknown consumer {consumer_id}"
            )));
        };

        if record.paused {
            let engine = Arc::clone(&self.context.engine);
            self.engine_call(
                Operation::ResumeConsumer,
                engine.resume_consumer(&consumer_id),
            )
            .await?;
            if let Some(record) = self.session.consumer_mut(&consumer_id) {
                record.paused = false;
            }
        }

        Ok(ServerMessage::ConsumerResumed {
            request_id,
            consumer_id,
        })
    }

    async fn close_producer(
        &mut self,
        request_id: Option<u64>,
        producer_id: ProducerId,
    ) -> Result<ServerMessage, SfuError> {
        if self.session.take_producer(&producer_id).is_none() {
            return Err(SfuError::StaleReference(format!(
                "unknown producer {producer_id}"
            )));
        }

        // Withdraw from the directory first so no peer consumes a producer
        // that is being closed.
        if let (Some(room), Some(peer_id)) = (self.room.clone(), self.session.peer_id()) {
            if let Err(e) = room
                .unpublish_producer(peer_id.to_string(), producer_id.clone())
                .await
            {
                debug!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Producer withdrawal failed"
                );
            }
        }

        self.release(EngineHandle::Producer(producer_id.clone()))
            .await;

        Ok(ServerMessage::ProducerClosed {
            request_id,
            producer_id,
        })
    }

    // ------------------------------------------------------------------
    // Room notifications
    // ------------------------------------------------------------------

    async fn handle_notification(&mut self, notification: RoomNotification) {
        if self.session.is_closing() {
            return;
        }

        match notification {
            RoomNotification::NewPeer { peer_id } => self.on_new_peer(peer_id).await,

            RoomNotification::ProducerAvailable { peer_id, producer } => {
                self.push(ServerMessage::ProducerAvailable {
                    peer_id: peer_id.clone(),
                    producer_id: producer.producer_id.clone(),
                    kind: producer.kind,
                });
                self.on_announcement(&peer_id, Some(producer)).await;
            }

            RoomNotification::ProducerClosed {
                peer_id,
                producer_id,
            } => {
                if let Some(consumer) = self.session.remove_consumer_of_producer(&producer_id) {
                    self.release(EngineHandle::Consumer(consumer.id.clone()))
                        .await;
                    self.push(ServerMessage::ConsumerClosed {
                        peer_id,
                        consumer_id: consumer.id,
                    });
                }
            }

            RoomNotification::PeerLeft { peer_id } => {
                for consumer in self.session.remove_consumers_of_peer(&peer_id) {
                    self.release(EngineHandle::Consumer(consumer.id.clone()))
                        .await;
                    self.push(ServerMessage::ConsumerClosed {
                        peer_id: peer_id.clone(),
                        consumer_id: consumer.id,
                    });
                }
                self.push(ServerMessage::PeerLeft { peer_id });
            }
        }
    }

    async fn on_new_peer(&mut self, peer_id: String) {
        self.push(ServerMessage::NewPeer {
            peer_id: peer_id.clone(),
        });
        self.on_announcement(&peer_id, None).await;
    }

    /// Consume from an announced peer now, or queue it until the receive
    /// transport connects.
    async fn on_announcement(&mut self, peer_id: &str, producer: Option<ProducerInfo>) {
        match self.session.announce(peer_id) {
            Announcement::ConsumeNow => match producer {
                Some(producer) => self.auto_consume(peer_id, producer).await,
                None => self.consume_peer(peer_id).await,
            },
            Announcement::Queued => {
                debug!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    peer_id = %peer_id,
                    pending = self.session.pending().len(),
                    "Announcement queued until receive transport connects"
                );
            }
            Announcement::Ignored => {}
        }
    }

    async fn flush_pending(&mut self) {
        let Some(peers) = self.session.flush_pending() else {
            return;
        };
        prom::record_pending_flush(peers.len());

        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            peers = peers.len(),
            "Flushing pending consumption queue"
        );

        for peer_id in peers {
            self.consume_peer(&peer_id).await;
        }
    }

    /// Consume every live producer of `peer_id`.
    async fn consume_peer(&mut self, peer_id: &str) {
        let Some(room) = self.room.clone() else {
            return;
        };
        match room.peer_producers(peer_id.to_string()).await {
            Ok(producers) => {
                for producer in producers {
                    self.auto_consume(peer_id, producer).await;
                }
            }
            Err(e) => {
                debug!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Announced peer no longer in room"
                );
            }
        }
    }

    /// Server-issued consume with the session's declared capabilities.
    async fn auto_consume(&mut self, peer_id: &str, producer: ProducerInfo) {
        if self.session.existing_consumer(peer_id, producer.kind).is_some() {
            return;
        }
        if self.session.rtp_capabilities().is_empty() {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                peer_id = %peer_id,
                "No receive capabilities declared, leaving consume to the client"
            );
            return;
        }

        let capabilities = self.session.rtp_capabilities().clone();
        match self.create_consumer(peer_id, &producer, &capabilities).await {
            Ok(record) => self.push(ServerMessage::NewConsumer {
                peer_id: record.peer_id,
                consumer_id: record.id,
                producer_id: record.producer_id,
                kind: record.kind,
                rtp_parameters: record.rtp_parameters,
                paused: record.paused,
            }),
            Err(error) => self.push_error(None, Operation::Consume, &error),
        }
    }

    async fn create_consumer(
        &mut self,
        peer_id: &str,
        producer: &ProducerInfo,
        capabilities: &RtpCapabilities,
    ) -> Result<ConsumerRecord, SfuError> {
        let transport_id = self.session.consume_transport()?;
        let engine = Arc::clone(&self.context.engine);

        // A producer the engine no longer knows is ConsumeFailed, not a
        // capability mismatch.
        let compatible = self
            .engine_call(
                Operation::Consume,
                engine.can_consume(&producer.producer_id, capabilities),
            )
            .await?;
        if !compatible {
            return Err(SfuError::IncompatibleCapabilities(format!(
                "cannot receive {} from {peer_id}",
                producer.kind
            )));
        }

        let info = self
            .engine_call(
                Operation::Consume,
                engine.create_consumer(
                    &transport_id,
                    &producer.producer_id,
                    capabilities,
                    self.context.consumers_start_paused,
                ),
            )
            .await?;

        let record = ConsumerRecord {
            id: info.id,
            producer_id: info.producer_id,
            peer_id: peer_id.to_string(),
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            paused: info.paused,
        };
        self.session.record_consumer(record.clone());

        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            consumer_id = %record.id,
            peer_id = %peer_id,
            kind = %record.kind,
            "Consumer created"
        );

        Ok(record)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn teardown(&mut self) {
        let released = self.session.begin_close();
        let released_count =
            released.consumers.len() + released.producers.len() + released.transports.len();

        // Leave the room before touching the engine: the peer set and
        // producer directory must not list this peer while releases wait on
        // the engine.
        if let (Some(room), Some(peer_id)) = (self.room.take(), self.session.peer_id()) {
            match room.remove_peer(peer_id.to_string()).await {
                Ok(outcome) => {
                    debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        room_id = %room.room_id(),
                        room_closed = outcome.room_closed,
                        "Peer removed from room"
                    );
                }
                Err(e) => {
                    debug!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        room_id = %room.room_id(),
                        error = %e,
                        "Room already gone during teardown"
                    );
                }
            }
        }

        for consumer_id in released.consumers {
            self.release(EngineHandle::Consumer(consumer_id)).await;
        }
        for producer_id in released.producers {
            self.release(EngineHandle::Producer(producer_id)).await;
        }
        for transport_id in released.transports {
            self.release(EngineHandle::Transport(transport_id)).await;
        }

        self.session.finish_close();

        debug!(
            target: "sfu.actor.connection",
            connection_id = %self.connection_id,
            released = released_count,
            "Session torn down"
        );
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Run an engine call for a request, bounded by the request timeout and
    /// abandoned if the connection drops.
    async fn engine_call<T>(
        &self,
        operation: Operation,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, SfuError> {
        tokio::select! {
            () = self.cancel_token.cancelled() => Err(SfuError::StaleReference(
                "connection closed".to_string(),
            )),
            result = tokio::time::timeout(self.context.request_timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(SfuError::from_engine(operation, e)),
                Err(_) => {
                    prom::record_engine_timeout(operation.as_str());
                    warn!(
                        target: "sfu.actor.connection",
                        connection_id = %self.connection_id,
                        operation = %operation,
                        timeout_ms = self.context.request_timeout.as_millis(),
                        "Media engine call timed out"
                    );
                    Err(SfuError::EngineUnavailable(format!("{operation} timed out")))
                }
            },
        }
    }

    /// Best-effort release of an engine object. Failures are logged only.
    async fn release(&self, handle: EngineHandle) {
        let kind = handle.kind();
        let id = handle.id().to_string();

        match tokio::time::timeout(self.context.request_timeout, self.context.engine.close(handle))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    kind = kind,
                    id = %id,
                    error = %e,
                    "Engine release failed"
                );
            }
            Err(_) => {
                prom::record_engine_timeout(Operation::Teardown.as_str());
                warn!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    kind = kind,
                    id = %id,
                    "Engine release timed out"
                );
            }
        }
    }

    fn joined_room(&self) -> Result<RoomActorHandle, SfuError> {
        self.room
            .clone()
            .ok_or_else(|| SfuError::InvalidState("not joined to a room".to_string()))
    }

    fn joined_peer_id(&self) -> Result<String, SfuError> {
        self.session
            .peer_id()
            .map(str::to_string)
            .ok_or_else(|| SfuError::InvalidState("not joined to a room".to_string()))
    }

    fn push(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(
                target: "sfu.actor.connection",
                connection_id = %self.connection_id,
                "Client channel closed, message dropped"
            );
        }
    }

    fn push_error(&self, request_id: Option<u64>, operation: Operation, error: &SfuError) {
        prom::record_error(operation.as_str(), error.error_code());
        match error {
            SfuError::Internal(_) | SfuError::Config(_) => {
                warn!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    operation = %operation,
                    error = %error,
                    "Request failed"
                );
            }
            _ => {
                debug!(
                    target: "sfu.actor.connection",
                    connection_id = %self.connection_id,
                    operation = %operation,
                    code = error.error_code(),
                    error = %error,
                    "Request rejected"
                );
            }
        }
        self.push(ServerMessage::error(request_id, operation, error));
    }
}

/// Pick the producer to consume: the requested kind, otherwise video first.
fn select_producer(producers: &[ProducerInfo], kind: Option<MediaKind>) -> Option<ProducerInfo> {
    match kind {
        Some(kind) => producers.iter().find(|p| p.kind == kind),
        None => producers
            .iter()
            .find(|p| p.kind == MediaKind::Video)
            .or_else(|| producers.first()),
    }
    .cloned()
}

fn consumed(request_id: Option<u64>, record: &ConsumerRecord) -> ServerMessage {
    ServerMessage::Consumed {
        request_id,
        peer_id: record.peer_id.clone(),
        consumer_id: record.id.clone(),
        producer_id: record.producer_id.clone(),
        kind: record.kind,
        rtp_parameters: record.rtp_parameters.clone(),
        paused: record.paused,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::registry::RegistrySettings;
    use crate::actors::room::RoomSettings;
    use crate::actors::session::SessionState;
    use crate::media::LoopbackEngine;

    fn context() -> ConnectionContext {
        let engine: SharedMediaEngine = Arc::new(LoopbackEngine::default());
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&engine),
            RegistrySettings {
                max_rooms: 10,
                request_timeout: Duration::from_secs(5),
                room: RoomSettings {
                    max_peers: 10,
                    empty_room_ttl: Duration::from_secs(300),
                    request_timeout: Duration::from_secs(5),
                },
            },
            Arc::clone(&metrics),
        );
        ConnectionContext {
            registry,
            engine,
            metrics,
            request_timeout: Duration::from_secs(5),
            consumers_start_paused: true,
        }
    }

    fn spawn(
        context: &ConnectionContext,
        connection_id: &str,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionActor::spawn(
            connection_id.to_string(),
            context.clone(),
            outbound,
            CancellationToken::new(),
        );
        (handle, task, rx)
    }

    async fn request(
        handle: &ConnectionActorHandle,
        rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
        request_id: u64,
        request: ClientRequest,
    ) -> ServerMessage {
        handle
            .submit(ClientEnvelope::new(request_id, request))
            .await
            .unwrap();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for response")
                .expect("outbound channel closed");
            if message.request_id() == Some(request_id) {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_create_and_join_room() {
        let context = context();
        let (handle, _task, mut rx) = spawn(&context, "conn-1");

        let response = request(
            &handle,
            &mut rx,
            1,
            ClientRequest::CreateRoom {
                room_id: "lobby".to_string(),
            },
        )
        .await;
        assert!(matches!(response, ServerMessage::RoomCreated { .. }));

        let response = request(
            &handle,
            &mut rx,
            2,
            ClientRequest::JoinRoom {
                room_id: "lobby".to_string(),
                peer_id: "alice".to_string(),
                rtp_capabilities: RtpCapabilities::default(),
            },
        )
        .await;
        match response {
            ServerMessage::RoomJoined {
                peer_id,
                recv_transport,
                send_transport,
                router_rtp_capabilities,
                peers,
                ..
            } => {
                assert_eq!(peer_id, "alice");
                assert_ne!(recv_transport.id, send_transport.id);
                assert!(!router_rtp_capabilities.codecs.is_empty());
                assert!(peers.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Joined);
        assert_eq!(snapshot.room_id.as_deref(), Some("lobby"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_join_unknown_room_leaves_session_unchanged() {
        let context = context();
        let (handle, _task, mut rx) = spawn(&context, "conn-1");

        let response = request(
            &handle,
            &mut rx,
            7,
            ClientRequest::JoinRoom {
                room_id: "R2".to_string(),
                peer_id: "c1".to_string(),
                rtp_capabilities: RtpCapabilities::default(),
            },
        )
        .await;
        match response {
            ServerMessage::Error {
                operation, code, ..
            } => {
                assert_eq!(operation, "joinRoom");
                assert_eq!(code, "ROOM_NOT_FOUND");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::AwaitingJoin);
        assert_eq!(snapshot.room_id, None);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_requests_before_join_are_rejected() {
        let context = context();
        let (handle, _task, mut rx) = spawn(&context, "conn-1");

        let response = request(
            &handle,
            &mut rx,
            1,
            ClientRequest::ResumeConsumer {
                consumer_id: ConsumerId::from("nope"),
            },
        )
        .await;
        match response {
            ServerMessage::Error { code, .. } => assert_eq!(code, "STALE_REFERENCE"),
            other => panic!("unexpected response: {other:?}"),
        }

        handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_and_room() {
        let context = context();
        let (handle, task, mut rx) = spawn(&context, "conn-1");

        request(
            &handle,
            &mut rx,
            1,
            ClientRequest::CreateRoom {
                room_id: "R3".to_string(),
            },
        )
        .await;
        request(
            &handle,
            &mut rx,
            2,
            ClientRequest::JoinRoom {
                room_id: "R3".to_string(),
                peer_id: "d".to_string(),
                rtp_capabilities: RtpCapabilities::default(),
            },
        )
        .await;
        assert_eq!(context.metrics.peer_count(), 1);

        handle.cancel();
        task.await.unwrap();

        assert!(context.registry.list_rooms().await.unwrap().is_empty());
        assert_eq!(context.metrics.peer_count(), 0);
        assert_eq!(context.metrics.connection_count(), 0);

        context.registry.cancel();
    }

    #[test]
    fn test_select_producer_prefers_video() {
        let audio = ProducerInfo {
            producer_id: ProducerId::from("a"),
            kind: MediaKind::Audio,
        };
        let video = ProducerInfo {
            producer_id: ProducerId::from("v"),
            kind: MediaKind::Video,
        };
        let both = vec![audio.clone(), video.clone()];

        assert_eq!(select_producer(&both, None), Some(video));
        assert_eq!(
            select_producer(&both, Some(MediaKind::Audio)),
            Some(audio.clone())
        );
        assert_eq!(
            select_producer(&[audio.clone()], None),
            Some(audio)
        );
        assert_eq!(select_producer(&[], Some(MediaKind::Video)), None);
    }
}
