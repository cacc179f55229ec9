pub mod connection;
pub mod transport;

pub use connection::{CloseReason, Connection, ConnectionId, Handshake, Inbound, SendControl};
pub use transport::{BoxedStream, ByteStream, Connector, PeerListener, TcpConnector};
