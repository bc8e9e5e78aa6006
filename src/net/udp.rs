//! Datagram transmission of converted pixel buffers.
//!
//! Fire-and-forget, at-most-once: every send opens a fresh socket, fires at
//! the fixed destination endpoint, and drops the socket. No acknowledgment,
//! no retry, no framing - the receiver must know the buffer geometry out of
//! band.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::NetworkConfig;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no address found for {0}")]
    Resolve(String),

    #[error("payload of {len} bytes exceeds the {max} byte datagram ceiling")]
    Oversize { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a buffer is mapped onto datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitMode {
    /// Whole buffer as one datagram; oversize payloads are an error.
    Single,
    /// Fixed-size packets with an inter-packet delay.
    Chunked,
}

/// What one send put on the wire.
#[derive(Debug, Clone, Copy)]
pub struct SendStats {
    pub datagrams: u64,
    pub bytes: u64,
}

pub struct UdpStreamer {
    dest: SocketAddr,
    source_port: u16,
    mode: TransmitMode,
    packet_size: usize,
    packet_delay: Duration,
}

impl UdpStreamer {
    /// Resolve the destination endpoint once; it stays fixed for the
    /// streamer's lifetime.
    pub fn from_config(config: &NetworkConfig) -> Result<Self, NetError> {
        let dest = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetError::Resolve(format!("{}:{}", config.host, config.port)))?;

        Ok(Self {
            dest,
            source_port: config.source_port,
            mode: config.mode,
            packet_size: config.packet_size.clamp(1, MAX_DATAGRAM_PAYLOAD),
            packet_delay: Duration::from_micros(config.packet_delay_us),
        })
    }

    pub fn new(dest: SocketAddr, mode: TransmitMode) -> Self {
        Self {
            dest,
            source_port: 0,
            mode,
            packet_size: 50_000,
            packet_delay: Duration::ZERO,
        }
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size.clamp(1, MAX_DATAGRAM_PAYLOAD);
        self
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Fresh socket per send. Address reuse is enabled before the bind so a
    /// fixed source port survives rapid per-send socket turnover.
    fn open_socket(&self) -> Result<UdpSocket, NetError> {
        let family = match self.dest {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None)
            .map_err(io::Error::from)?;
        socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

        match self.dest {
            SocketAddr::V4(_) => {
                let local = SockaddrIn::from(std::net::SocketAddrV4::new(
                    Ipv4Addr::UNSPECIFIED,
                    self.source_port,
                ));
                socket::bind(fd.as_raw_fd(), &local).map_err(io::Error::from)?;
            }
            SocketAddr::V6(_) => {
                let local = SockaddrIn6::from(std::net::SocketAddrV6::new(
                    Ipv6Addr::UNSPECIFIED,
                    self.source_port,
                    0,
                    0,
                ));
                socket::bind(fd.as_raw_fd(), &local).map_err(io::Error::from)?;
            }
        }

        Ok(UdpSocket::from(fd))
    }

    /// Send one buffer according to the configured transmit mode.
    pub fn send(&self, payload: &[u8]) -> Result<SendStats, NetError> {
        match self.mode {
            TransmitMode::Single => self.send_single(payload),
            TransmitMode::Chunked => self.send_chunked(payload),
        }
    }

    /// Whole buffer as one outbound datagram.
    pub fn send_single(&self, payload: &[u8]) -> Result<SendStats, NetError> {
        if payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(NetError::Oversize {
                len: payload.len(),
                max: MAX_DATAGRAM_PAYLOAD,
            });
        }

        let socket = self.open_socket()?;
        let bytes = socket.send_to(payload, self.dest)?;
        trace!(bytes, dest = %self.dest, "sent datagram");
        Ok(SendStats {
            datagrams: 1,
            bytes: bytes as u64,
        })
    }

    /// Buffer split into fixed-size packets, paced by the inter-packet
    /// delay. Accommodates payloads far above the datagram ceiling.
    pub fn send_chunked(&self, payload: &[u8]) -> Result<SendStats, NetError> {
        let socket = self.open_socket()?;
        let mut stats = SendStats {
            datagrams: 0,
            bytes: 0,
        };
        for chunk in payload.chunks(self.packet_size) {
            stats.bytes += socket.send_to(chunk, self.dest)? as u64;
            stats.datagrams += 1;
            if !self.packet_delay.is_zero() {
                std::thread::sleep(self.packet_delay);
            }
        }
        trace!(
            datagrams = stats.datagrams,
            bytes = stats.bytes,
            dest = %self.dest,
            "sent chunked buffer"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn single_send_roundtrips_byte_identical() {
        let (receiver, addr) = loopback_receiver();
        let streamer = UdpStreamer::new(addr, TransmitMode::Single);

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let stats = streamer.send(&payload).unwrap();
        assert_eq!((stats.datagrams, stats.bytes), (1, payload.len() as u64));

        let mut buf = vec![0u8; payload.len() + 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[test]
    fn single_send_rejects_oversize_payload() {
        let (_receiver, addr) = loopback_receiver();
        let streamer = UdpStreamer::new(addr, TransmitMode::Single);

        let payload = vec![0u8; MAX_DATAGRAM_PAYLOAD + 1];
        assert!(matches!(
            streamer.send(&payload),
            Err(NetError::Oversize { .. })
        ));
    }

    #[test]
    fn chunked_send_splits_and_reassembles() {
        let (receiver, addr) = loopback_receiver();
        let streamer = UdpStreamer::new(addr, TransmitMode::Chunked).with_packet_size(50_000);

        let payload: Vec<u8> = (0..120_000u32).map(|i| (i % 239) as u8).collect();
        let stats = streamer.send(&payload).unwrap();
        assert_eq!(stats.datagrams, 3);
        assert_eq!(stats.bytes, payload.len() as u64);

        let mut reassembled = Vec::new();
        let mut buf = vec![0u8; 65_536];
        for _ in 0..stats.datagrams {
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            reassembled.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn packet_size_is_clamped_to_the_ceiling() {
        let (_receiver, addr) = loopback_receiver();
        let streamer =
            UdpStreamer::new(addr, TransmitMode::Chunked).with_packet_size(10_000_000);
        assert_eq!(streamer.packet_size, MAX_DATAGRAM_PAYLOAD);
    }
}
