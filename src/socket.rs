//! Raw GRE senders and the UDP return-path receiver.
//!
//! The IPv4 sender builds its own outermost IPv4 header byte-for-byte (version,
//! length, TOS, TTL=64, protocol=47) and hands the kernel the finished datagram
//! via `IP_HDRINCL`, the way the original implementation's raw-socket wrapper
//! does. The IPv6 sender instead relies on a control message carrying source
//! address and traffic class and lets the kernel supply the header. Receiving
//! uses a plain UDP socket with kernel receive timestamps when the platform
//! provides them, falling back to a wall-clock read otherwise.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsFd, AsRawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::socket::{
    bind, recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn, SockaddrIn6,
};
use nix::sys::time::TimeSpec;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::SocketError;

const IPPROTO_GRE: i32 = 47;

/// A raw socket that sends already-crafted GRE packets to one address family.
pub struct RawSender {
    socket: Socket,
    domain: Domain,
}

impl RawSender {
    pub fn new_v4() -> Result<Self, SocketError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_GRE)))
            .map_err(|source| SocketError::Create {
                family: "IPv4",
                source,
            })?;

        // We hand-assemble the outer IPv4 header ourselves (TTL=64, protocol
        // GRE) rather than letting the kernel fill one in, so the kernel must
        // be told not to prepend its own.
        set_hdrincl(&socket).map_err(|source| SocketError::SetOption {
            option: "IP_HDRINCL",
            source,
        })?;

        Ok(Self {
            socket,
            domain: Domain::IPV4,
        })
    }

    pub fn new_v6() -> Result<Self, SocketError> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(IPPROTO_GRE)))
            .map_err(|source| SocketError::Create {
                family: "IPv6",
                source,
            })?;

        Ok(Self {
            socket,
            domain: Domain::IPV6,
        })
    }

    /// Sends `packet` to `dst`, leaving from `src` with traffic class `tos`.
    ///
    /// IPv6 sets `src`/`tos` per-packet via control messages, since targets
    /// sharing this sender may disagree on both. IPv4 instead prepends an
    /// explicit outer header carrying the same information, because `send_v4`
    /// builds the header itself rather than asking the kernel to.
    pub fn send(&self, packet: &[u8], dst: IpAddr, src: IpAddr, tos: u8) -> Result<usize, io::Error> {
        match (self.domain, dst, src) {
            (Domain::IPV4, IpAddr::V4(dst), IpAddr::V4(src)) => self.send_v4(packet, dst, src, tos),
            (Domain::IPV6, IpAddr::V6(dst), IpAddr::V6(src)) => self.send_v6(packet, dst, src, tos),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family does not match this sender",
            )),
        }
    }

    /// Builds the outer IPv4 header explicitly (TTL 64, protocol GRE, the
    /// given TOS) and hands the kernel the whole datagram via `IP_HDRINCL`,
    /// rather than leaving TTL/TOS/source to kernel defaults.
    fn send_v4(&self, packet: &[u8], dst: Ipv4Addr, src: Ipv4Addr, tos: u8) -> Result<usize, io::Error> {
        let dest_addr = SockaddrIn::from(SocketAddrV4::new(dst, 0));

        let mut datagram = Vec::with_capacity(20 + packet.len());
        crate::packet::push_ipv4_header(&mut datagram, src, dst, tos, IPPROTO_GRE as u8, packet.len());
        datagram.extend_from_slice(packet);

        let cmsgs: [ControlMessage; 0] = [];
        let iov = [io::IoSlice::new(&datagram)];
        sendmsg(
            self.socket.as_fd().as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            Some(&dest_addr),
        )
        .map_err(io::Error::from)
    }

    fn send_v6(&self, packet: &[u8], dst: Ipv6Addr, src: Ipv6Addr, tos: u8) -> Result<usize, io::Error> {
        let dest_addr = SockaddrIn6::from(SocketAddrV6::new(dst, 0, 0, 0));
        let pktinfo = nix::libc::in6_pktinfo {
            ipi6_addr: nix::libc::in6_addr {
                s6_addr: src.octets(),
            },
            ipi6_ifindex: 0,
        };
        let tclass: i32 = tos as i32;

        let cmsgs = [
            ControlMessage::Ipv6PacketInfo(&pktinfo),
            ControlMessage::Ipv6TClass(&tclass),
        ];

        let iov = [io::IoSlice::new(packet)];
        sendmsg(
            self.socket.as_fd().as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            Some(&dest_addr),
        )
        .map_err(io::Error::from)
    }
}

/// A received probe reply: its bytes and the timestamp it was received at.
pub struct Received {
    pub bytes: Vec<u8>,
    pub recv_ts_ns: i64,
}

/// The UDP socket probes return to. Bound by scanning `base_port..=base_port+65534`
/// for the first free port, matching the sender side encoding the port in the probe.
pub struct UdpReceiver {
    socket: Socket,
    pub port: u16,
}

impl UdpReceiver {
    pub fn bind_in_range(domain: Domain, base_port: u16) -> Result<Self, SocketError> {
        for offset in 0..=u16::MAX {
            let port = base_port.wrapping_add(offset);
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
                SocketError::Create {
                    family: if domain == Domain::IPV4 { "IPv4" } else { "IPv6" },
                    source,
                }
            })?;

            let addr: SocketAddr = if domain == Domain::IPV4 {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
            };

            if bind(socket.as_fd().as_raw_fd(), &to_sockaddr(addr)).is_ok() {
                enable_timestamping(&socket).map_err(|source| SocketError::SetOption {
                    option: "SO_TIMESTAMPNS",
                    source,
                })?;
                return Ok(Self { socket, port });
            }

            if offset == u16::MAX {
                break;
            }
        }

        Err(SocketError::NoFreePort { base: base_port })
    }

    /// Blocks for the next datagram, returning its payload and receive time.
    ///
    /// Prefers the kernel's `SO_TIMESTAMPNS` control message; falls back to a
    /// wall-clock read if the platform didn't attach one to this datagram.
    pub fn recv(&self) -> Result<Received, io::Error> {
        let mut buf = [0u8; 512];
        let mut iov = [io::IoSliceMut::new(&mut buf)];
        let mut cmsg_buf = nix::cmsg_space!(TimeSpec);

        let msg = recvmsg::<()>(
            self.socket.as_fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let recv_ts_ns = msg
            .cmsgs()
            .ok()
            .into_iter()
            .flatten()
            .find_map(|cmsg| match cmsg {
                ControlMessageOwned::ScmTimestampsns(ts) => {
                    Some(ts.system.tv_sec() * 1_000_000_000 + ts.system.tv_nsec())
                }
                ControlMessageOwned::ScmTimestampns(ts) => {
                    Some(ts.tv_sec() * 1_000_000_000 + ts.tv_nsec())
                }
                _ => None,
            })
            .unwrap_or_else(wall_clock_ns);

        let len = msg.bytes;
        Ok(Received {
            bytes: buf[..len].to_vec(),
            recv_ts_ns,
        })
    }
}

/// Tells the kernel the outer IPv4 header is already present in every
/// datagram this socket sends, instead of building one from socket options.
fn set_hdrincl(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_fd().as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn enable_timestamping(socket: &Socket) -> io::Result<()> {
    let fd = socket.as_fd().as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn to_sockaddr(addr: SocketAddr) -> nix::sys::socket::SockaddrStorage {
    nix::sys::socket::SockaddrStorage::from(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_ns_is_monotonically_plausible() {
        let a = wall_clock_ns();
        let b = wall_clock_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
