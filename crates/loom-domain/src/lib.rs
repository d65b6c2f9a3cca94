//! Loom Domain Core
//!
//! This crate contains the pure domain model for the loom coordination
//! service, including:
//! - Registry entries, scopes, visibility and redaction rules
//! - Agent identities and deterministic id derivation
//! - Work items and dead-letter items
//! - Inbox and channel message payloads
//! - Pagination cursors and duration parsing
//!
//! This crate MUST NOT import the messaging substrate, the async runtime,
//! or any other I/O machinery. Everything here is deterministic and
//! synchronous.

pub mod channel;
pub mod cursor;
pub mod duration;
pub mod error;
pub mod identity;
pub mod message;
pub mod registry;
pub mod validate;
pub mod work;

pub use channel::*;
pub use cursor::*;
pub use error::*;
pub use identity::*;
pub use message::*;
pub use registry::*;
pub use work::*;
