//! Loom Substrate Adapters
//!
//! Two implementations of the substrate port:
//! - `NatsSubstrate`: NATS JetStream, the production substrate
//! - `MemorySubstrate`: in-process, for tests and local development

pub mod memory;
pub mod nats;

pub use memory::MemorySubstrate;
pub use nats::{NatsConfig, NatsSubstrate};
