//! UDP networking: address resolution, transport and the polling loop

pub mod addr;
pub mod poller;
pub mod transport;

pub use poller::Poller;
pub use transport::{UdpPacket, UdpTransport};
