pub mod connection;
pub mod consumer;
pub mod destination;
pub mod extension;
pub mod handshake;
pub mod protocol;

pub use crate::core::*;

pub use connection::Connection;
pub(crate) use connection::ConnectionParts;
pub use consumer::*;
pub use destination::*;
pub use extension::*;
pub use handshake::*;
pub use protocol::*;
