mod transport;

pub use transport::{redact_url, NatsConnectSettings, NatsTransport};
