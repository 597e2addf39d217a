//! Actor model implementation for the SFU controller.
//!
//! ```text
//! RoomRegistryActor (singleton per controller instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per room with an allocated router)
//!         └── notifies the ConnectionActors of its peers
//!
//! ConnectionActor (one per signaling connection)
//! └── owns one PeerSession and its pending-consumption queue
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per room**: membership and the producer directory are
//!   only mutated inside the room's actor, so concurrent joins and leaves are
//!   serialised and never lose an update
//! - **Registry reservations**: a room ID is reserved before its router is
//!   allocated, so concurrent `createRoom` calls for one ID allocate one router
//! - **CancellationToken propagation**: rooms run on child tokens of the
//!   registry; connections run on child tokens of the signaling shutdown token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500,
//!   Connection: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton, room ID to room mapping
//! - [`room`] - `RoomActor` per room, peers and producer directory
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`session`] - Per-peer session state machine
//! - [`pending`] - Pending-consumption queue for early announcements
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod room;
pub mod session;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, ConnectionContext};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use pending::PendingConsumption;
pub use registry::{RegistrySettings, RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};
pub use session::{PeerSession, SessionSnapshot, SessionState};
