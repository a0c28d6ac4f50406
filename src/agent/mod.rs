//! Duplex link to the remote agent.
//!
//! The encrypted transport itself is outside this daemon; the agent is an
//! opaque duplex stream of JSON frames reached through the supervised
//! child's local port. This module owns everything from the frame shapes
//! up to the sequenced, de-duplicated event stream:
//!
//! - [`wire`]: inbound/outbound frame shapes and line parsing.
//! - [`transport`]: the dyn-safe duplex transport trait, the WebSocket
//!   implementation, and an in-process pair for harnesses.
//! - [`session`]: the per-session worker that decodes frames, filters
//!   duplicates, assigns sequence numbers, and survives reconnects.

pub mod session;
pub mod transport;
pub mod wire;
