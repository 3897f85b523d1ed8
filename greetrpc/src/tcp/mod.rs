mod connection;
pub(crate) use connection::Connection;

mod tcp_transport;
pub use tcp_transport::TcpTransport;

/// Default depth of the per-connection queue of encoded frames.
pub(crate) const SEND_QUEUE_SIZE: usize = 1024;
