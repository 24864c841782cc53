//! Client for the desktop application control protocol spoken over window
//! messages (discover/attach handshake plus `WM_COPYDATA` text commands).

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use connection::ConnectionStatus;
pub use error::{ClientError, ConnectionStateError, PeerRefusal};
pub use events::{ClientEvent, ExecutionContext, InlineContext, RuntimeContext};
pub use model::{Call, ConferenceParticipant, User};
pub use protocol::{CallSetProperty, Command, DecodeError, Verb};
pub use session::PeerInfo;
pub use transport::{MemoryTransport, PeerHandle, Transport, TransportError};
