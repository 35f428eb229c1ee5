pub mod addr;
pub mod error;
pub mod stream;
pub mod udp;

pub use addr::Address;
pub use error::CoreError;
pub use stream::{PrefixedStream, ProxyStream};
pub use udp::{BoxUdpTransport, UdpPacket, UdpTransport};
