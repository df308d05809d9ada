//! The datagram transport the session/listener layers run over: an opaque
//! bidirectional endpoint delivering and accepting MTU-bounded byte slices
//! keyed by peer address. `UdpCarrier` is the default trivial carrier; the
//! feature-gated raw-ICMP carrier is the primary intended mode.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// A peer identity on whichever carrier is in use. UDP fills in the real
/// source port; ICMP has no concept of ports, so its carrier always reports
/// port `0` — peers are distinguished by IP address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// The external carrier abstraction: `read`/`write` keyed by peer address,
/// `local_addr`, `close`, and the optional socket knobs a session may
/// forward to it when it owns the carrier outright.
pub trait Carrier: Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddr)>;
    fn send_to(&self, buf: &[u8], peer: PeerAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<PeerAddr>;
    fn close(&self) -> io::Result<()>;

    fn set_read_buffer(&self, _bytes: usize) -> io::Result<()> {
        Ok(())
    }
    fn set_write_buffer(&self, _bytes: usize) -> io::Result<()> {
        Ok(())
    }
    fn set_dscp(&self, _dscp: u32) -> io::Result<()> {
        Ok(())
    }
}

/// The trivial carrier: a plain UDP socket.
pub struct UdpCarrier {
    socket: UdpSocket,
}

/// Receivers poll at this cadence so a closed session's receiver thread
/// notices within one tick instead of blocking forever in `recv_from`.
const POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(200);

impl UdpCarrier {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(UdpCarrier { socket })
    }

    /// Binds an ephemeral local port and fixes the peer for `send_to`/
    /// `recv_from` at the OS level: one socket per outbound session.
    pub fn dial(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        }
        .parse()
        .unwrap();
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(UdpCarrier { socket })
    }
}

impl Carrier for UdpCarrier {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddr)> {
        let (n, addr) = self.socket.recv_from(buf)?;
        Ok((n, addr.into()))
    }

    fn send_to(&self, buf: &[u8], peer: PeerAddr) -> io::Result<usize> {
        self.socket.send_to(buf, SocketAddr::new(peer.ip, peer.port))
    }

    fn local_addr(&self) -> io::Result<PeerAddr> {
        self.socket.local_addr().map(Into::into)
    }

    fn close(&self) -> io::Result<()> {
        // UdpSocket has no portable shutdown(); the receiver thread notices
        // a session/listener close by polling the closed flag between the
        // bounded-timeout recv_from calls set up in `bind`/`dial` above.
        Ok(())
    }
}

#[cfg(feature = "raw-icmp")]
pub use icmp::IcmpCarrier;

#[cfg(feature = "raw-icmp")]
mod icmp {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    use super::{Carrier, PeerAddr};
    use crate::consts::ICMP_ECHO_ID;

    const ICMP_ECHO_REQUEST: u8 = 8;
    const ICMP_ECHO_REPLY: u8 = 0;

    /// A raw-socket ICMPv4 carrier: every outbound datagram rides inside an
    /// Echo Request (client) or Echo Reply (server) payload. Requires
    /// `CAP_NET_RAW` (or root) — opt in with the `raw-icmp` feature.
    pub struct IcmpCarrier {
        socket: Socket,
        send_replies: bool,
        seq: AtomicU16,
    }

    impl IcmpCarrier {
        pub fn new(send_replies: bool) -> io::Result<Self> {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
            socket.set_read_timeout(Some(Duration::from_millis(500)))?;
            Ok(IcmpCarrier {
                socket,
                send_replies,
                seq: AtomicU16::new(0),
            })
        }
    }

    impl Carrier for IcmpCarrier {
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddr)> {
            let mut raw = [std::mem::MaybeUninit::new(0u8); 1500];
            loop {
                let (n, from) = self.socket.recv_from(&mut raw)?;
                // SAFETY: recv_from only initializes the first n bytes, and
                // we only ever read within that prefix below.
                let packet: &[u8] =
                    unsafe { std::slice::from_raw_parts(raw.as_ptr() as *const u8, n) };

                let Some((ihl, payload)) = split_ip_header(packet) else {
                    continue;
                };
                let _ = ihl;
                if payload.len() < 8 {
                    continue;
                }
                let icmp_type = payload[0];
                let id = u16::from_be_bytes([payload[4], payload[5]]);
                if id != ICMP_ECHO_ID {
                    continue;
                }
                let expected_type = if self.send_replies {
                    ICMP_ECHO_REQUEST
                } else {
                    ICMP_ECHO_REPLY
                };
                if icmp_type != expected_type {
                    continue;
                }

                let body = &payload[8..];
                let copy = body.len().min(buf.len());
                buf[..copy].copy_from_slice(&body[..copy]);

                let ip = match from.as_socket_ipv4() {
                    Some(addr) => IpAddr::V4(*addr.ip()),
                    None => continue,
                };
                return Ok((copy, PeerAddr { ip, port: 0 }));
            }
        }

        fn send_to(&self, buf: &[u8], peer: PeerAddr) -> io::Result<usize> {
            let IpAddr::V4(ip) = peer.ip else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "ICMP carrier only supports IPv4 peers",
                ));
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let icmp_type = if self.send_replies {
                ICMP_ECHO_REPLY
            } else {
                ICMP_ECHO_REQUEST
            };
            let packet = build_echo(icmp_type, ICMP_ECHO_ID, seq, buf);
            let addr = SockAddr::from(std::net::SocketAddr::new(IpAddr::V4(ip), 0));
            self.socket.send_to(&packet, &addr)?;
            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<PeerAddr> {
            Ok(PeerAddr {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 0,
            })
        }

        fn close(&self) -> io::Result<()> {
            self.socket.shutdown(std::net::Shutdown::Both)
        }
    }

    /// Returns `(header_len, payload)` for a well-formed IPv4 packet, or
    /// `None` if `packet` is too short or not IPv4.
    fn split_ip_header(packet: &[u8]) -> Option<(usize, &[u8])> {
        if packet.is_empty() {
            return None;
        }
        let version = packet[0] >> 4;
        if version != 4 {
            return None;
        }
        let ihl = ((packet[0] & 0x0F) as usize) * 4;
        if packet.len() < ihl {
            return None;
        }
        Some((ihl, &packet[ihl..]))
    }

    fn build_echo(icmp_type: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(8 + payload.len());
        packet.push(icmp_type);
        packet.push(0); // code
        packet.extend_from_slice(&[0, 0]); // checksum placeholder
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(payload);

        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        packet
    }

    fn icmp_checksum(data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            sum += (*last as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_carrier_round_trips_a_datagram() {
        let a = UdpCarrier::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpCarrier::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.ip, a.local_addr().unwrap().ip);
    }

    #[test]
    fn peer_addr_display_omits_port_when_zero() {
        let p = PeerAddr {
            ip: "10.0.0.1".parse().unwrap(),
            port: 0,
        };
        assert_eq!(p.to_string(), "10.0.0.1");
    }
}
