use std::{
    fmt, io,
    mem::MaybeUninit,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

/// Address family of the probed target. Everything that differs on the wire
/// between ICMP and ICMPv6 hangs off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family used to reach `addr`. IPv4-mapped IPv6 addresses are treated as
    /// IPv4, see [`Family::normalize`].
    pub fn of(addr: &IpAddr) -> Family {
        match Family::normalize(*addr) {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Collapse `::ffff:a.b.c.d` into its 4-byte form.
    pub fn normalize(addr: IpAddr) -> IpAddr {
        match addr {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        }
    }

    /// Wildcard address the raw socket listens on
    pub fn listen_address(&self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// IANA protocol number (1 for ICMP, 58 for ICMPv6)
    pub fn protocol_number(&self) -> u8 {
        match self {
            Family::V4 => 1,
            Family::V6 => 58,
        }
    }

    pub fn echo_request_type(&self) -> u8 {
        match self {
            Family::V4 => 8,
            Family::V6 => 128,
        }
    }

    pub fn echo_reply_type(&self) -> u8 {
        match self {
            Family::V4 => 0,
            Family::V6 => 129,
        }
    }

    fn domain(&self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    fn protocol(&self) -> Protocol {
        match self {
            Family::V4 => Protocol::ICMPV4,
            Family::V6 => Protocol::ICMPV6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ip4:icmp"),
            Family::V6 => write!(f, "ip6:ipv6-icmp"),
        }
    }
}

// Strong type for a raw ICMP socket of one family
pub struct ICMPSocket {
    socket: Socket,
    family: Family,
}

impl ICMPSocket {
    /// Open a raw socket for `family` bound to the family's wildcard address.
    /// Needs CAP_NET_RAW (or root).
    pub fn new(family: Family) -> io::Result<ICMPSocket> {
        let socket =
            Socket::new(family.domain(), Type::RAW, Some(family.protocol()))?;
        socket.set_nonblocking(true)?;
        let listen = SocketAddr::new(family.listen_address(), 0);
        socket.bind(&listen.into())?;

        Ok(ICMPSocket { socket, family })
    }
    pub fn family(&self) -> Family {
        self.family
    }
    pub fn get_ref(&self) -> &Socket {
        &self.socket
    }
}

impl AsRawFd for ICMPSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

pub struct AsyncICMPSocket {
    inner: AsyncFd<ICMPSocket>,
}

impl AsyncICMPSocket {
    /// Must be called from within a tokio runtime.
    pub fn new(socket: ICMPSocket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub fn family(&self) -> Family {
        self.inner.get_ref().family()
    }

    pub async fn send_to(
        &mut self,
        packet: &[u8],
        addr: &IpAddr,
    ) -> io::Result<usize> {
        // Raw sockets ignore the port
        let addr = SockAddr::from(SocketAddr::new(*addr, 0));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard
                .try_io(|inner| inner.get_ref().get_ref().send_to(packet, &addr))
            {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one ICMP message into `buf`. For IPv4 the kernel hands us the
    /// IP header as well, which is stripped so callers always get the bare
    /// ICMP message.
    pub async fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> io::Result<(usize, IpAddr)> {
        let (len, peer) = loop {
            let mut guard = self.inner.readable().await?;
            // Safety: an initialised &mut [u8] is a valid
            // &mut [MaybeUninit<u8>], and recv_from only ever writes to it.
            let uninit = unsafe {
                &mut *(&mut *buf as *mut [u8] as *mut [MaybeUninit<u8>])
            };
            match guard
                .try_io(|inner| inner.get_ref().get_ref().recv_from(uninit))
            {
                Ok(res) => break res?,
                Err(_would_block) => continue,
            }
        };
        let peer = peer
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address")
            })?;

        let len = match self.family() {
            Family::V4 => strip_ipv4_header(buf, len)?,
            Family::V6 => len,
        };
        Ok((len, peer))
    }
}

/// Shift the payload of the IPv4 datagram in `buf[..len]` to the front of the
/// buffer and return its length.
fn strip_ipv4_header(buf: &mut [u8], len: usize) -> io::Result<usize> {
    let invalid =
        |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());
    if len == 0 {
        return Err(invalid("empty IPv4 datagram"));
    }
    if buf[0] >> 4 != 4 {
        return Err(invalid("not an IPv4 datagram"));
    }
    let ihl = usize::from(buf[0] & 0x0f) * 4;
    if ihl < 20 || ihl > len {
        return Err(invalid("IPv4 header length out of range"));
    }
    buf.copy_within(ihl..len, 0);
    Ok(len - ihl)
}

/// Point-in-time view of the loss counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossSnapshot {
    pub lost: u64,
    pub sent: u64,
    pub loss_percent: f64,
}

impl fmt::Display for LossSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "packet loss = {}/{} ({:.2}%)",
            self.lost, self.sent, self.loss_percent
        )
    }
}

/// Running packet loss. Written by the probe loop, read by whoever reports
/// the final summary; every read sees a complete update.
#[derive(Debug, Default)]
pub struct LossStatistics {
    inner: Mutex<LossSnapshot>,
}

impl LossStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) -> LossSnapshot {
        let mut state = self.inner.lock();
        state.sent += 1;
        state.loss_percent = loss_percent(state.lost, state.sent);
        *state
    }

    pub fn record_failure(&self) -> LossSnapshot {
        let mut state = self.inner.lock();
        state.sent += 1;
        state.lost += 1;
        state.loss_percent = loss_percent(state.lost, state.sent);
        *state
    }

    pub fn snapshot(&self) -> LossSnapshot {
        *self.inner.lock()
    }
}

fn loss_percent(lost: u64, sent: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    lost as f64 / sent as f64 * 100.0
}
