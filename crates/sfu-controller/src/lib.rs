//! Switchboard SFU Controller Library
//!
//! Signaling and orchestration layer for a selective forwarding unit. The
//! controller never touches media; it drives an external media engine and
//! keeps every client's view of a room consistent:
//!
//! - Room lifecycle: one router per room, created on demand, released when
//!   the last peer leaves
//! - Peer sessions: join, transport negotiation, producing and consuming
//! - WebSocket signaling with request correlation and typed error events
//! - Handshake ordering: announcements that arrive before a peer can receive
//!   are queued and consumed once, in order, when it becomes ready
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per room)
//!
//! ConnectionActor (one per WebSocket) ── MediaEngine (external SFU)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors, peer session state
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`media`] - Media engine adapter trait and loopback engine
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire protocol and WebSocket gateway

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;
