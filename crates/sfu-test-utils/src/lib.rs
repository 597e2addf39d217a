//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU controller.
//!
//! This crate provides a scriptable media engine, an in-process signaling
//! client and negotiation fixtures, so signaling flows can be tested without
//! a real SFU worker or a WebSocket.
//!
//! ## Modules
//!
//! - `scripted_engine` - Media engine wrapper with injectable failures and hangs
//! - `client` - Test harness and client driving a `ConnectionActor`
//! - `fixtures` - DTLS parameters, RTP parameters and device capabilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::new();
//!     let mut alice = sfu.client("alice");
//!
//!     alice.create_room("lobby").await.unwrap();
//!     alice.join("lobby", "alice").await.unwrap();
//!     alice.connect_both().await.unwrap();
//!     alice.produce(MediaKind::Video).await.unwrap();
//! }
//! ```
//!
//! ## Failure Injection
//!
//! ```rust,ignore
//! let sfu = TestSfu::new();
//! sfu.engine.fail_next(EngineCall::CreateTransport, EngineError::Rejected("no ports".into()));
//! sfu.engine.hang(EngineCall::ConnectTransport);
//! ```

pub mod client;
pub mod fixtures;
pub mod scripted_engine;

// Re-export commonly used items
pub use client::*;
pub use fixtures::*;
pub use scripted_engine::*;
