//! Wire framing, the connection state machine, and the transports that
//! drive the Haggle protocol engine (spec §4.7 "Protocol Engine", §6
//! "External Interfaces").

pub mod connection;
pub mod framing;
pub mod peer;
pub mod transport;

pub use connection::{Connection, ConnectionError, ConnectionEvent, ConnectionState};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use peer::{PeerId, PeerInfo};
pub use transport::{TcpTransport, TransportError, TransportEvent, UdpApplicationTransport};
