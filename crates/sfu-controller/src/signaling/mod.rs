//! Signaling gateway.
//!
//! Clients talk to the controller over one WebSocket each. Every socket gets
//! a [`crate::actors::ConnectionActor`] that owns the peer session and
//! serialises the client's requests:
//!
//! ```text
//! WebSocket ──frames──> reader ──ClientEnvelope──> ConnectionActor
//!     ^                                               │
//!     └──────── writer <──────── ServerMessage ───────┘
//! ```
//!
//! # Modules
//!
//! - [`protocol`] - JSON message types and frame parsing
//! - [`websocket`] - axum upgrade handler and socket pump

pub mod protocol;
pub mod websocket;

pub use protocol::{parse_client_frame, ClientEnvelope, ClientRequest, ServerMessage};
pub use websocket::{signaling_router, SignalingState};
