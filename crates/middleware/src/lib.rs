//! market-middleware: Pluggable pub/sub transport
//!
//! Provides a trait-based abstraction over the message bus with a NATS
//! implementation for production and an in-memory implementation for testing.
//! Both honour queue-group (competing consumer) delivery.

pub mod error;
pub mod memory;
pub mod nats;
pub mod transport;

pub use error::TransportError;
pub use memory::InMemoryTransport;
pub use nats::{redact_url, NatsConnectSettings, NatsTransport};
pub use transport::{Subscription, Transport, TransportMessage};
