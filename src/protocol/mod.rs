//! Command/event transport to the instrumented target.

pub mod connection;
pub mod events;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::StreamConnection;
pub use events::{AnyEventHandler, EventHandler, ListenerId, ListenerRegistry};
pub use session::{DEFAULT_PROTOCOL_TIMEOUT, MAX_PROTOCOL_TIMEOUT, ProtocolSession};
pub use transport::{ProtocolEvent, ProtocolTransport};
