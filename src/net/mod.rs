pub mod udp;

pub use udp::{NetError, SendStats, TransmitMode, UdpStreamer, MAX_DATAGRAM_PAYLOAD};
