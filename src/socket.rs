use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::warn;

/// Transparent UDP ingress socket. `IP_TRANSPARENT` lets the TPROXY'd
/// datagrams land here even though their destination address is not local;
/// `IP_RECVORIGDSTADDR` exposes that destination per datagram so egress can
/// spoof it back. Requires CAP_NET_ADMIN.
pub struct TransparentSocket {
    fd: AsyncFd<std::net::UdpSocket>,
}

impl TransparentSocket {
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("create udp socket")?;
        socket
            .set_reuse_address(true)
            .context("set SO_REUSEADDR")?;
        set_ipv4_opt(&socket, libc::IP_TRANSPARENT, 1)
            .context("set IP_TRANSPARENT (requires CAP_NET_ADMIN)")?;
        // best effort: without it egress falls back to the fixed spoof source
        if let Err(err) = set_ipv4_opt(&socket, libc::IP_RECVORIGDSTADDR, 1) {
            warn!(error = %err, "IP_RECVORIGDSTADDR unavailable, spoofed source falls back to default");
        }
        let addr: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .with_context(|| format!("bind 0.0.0.0:{port}"))?;
        socket.set_nonblocking(true).context("set nonblocking")?;

        let fd = AsyncFd::new(std::net::UdpSocket::from(socket)).context("register with runtime")?;
        Ok(Self { fd })
    }

    /// Receive one datagram along with the sender and, when the kernel
    /// delivered it, the original (pre-TPROXY) destination.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<SocketAddrV4>)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_with_origdst(inner.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_ipv4_opt(socket: &Socket, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[repr(align(8))]
struct CmsgBuffer([u8; 64]);

fn recv_with_origdst(
    socket: &std::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<SocketAddrV4>)> {
    let mut src: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control = CmsgBuffer([0u8; 64]);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.0.len() as _;

    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut original_dst = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_IP && (*cmsg).cmsg_type == libc::IP_ORIGDSTADDR {
                let addr =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::sockaddr_in);
                original_dst = Some(sockaddr_in_to_v4(&addr));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let peer = SocketAddr::V4(sockaddr_in_to_v4(&src));
    Ok((len as usize, peer, original_dst))
}

fn sockaddr_in_to_v4(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

/// Raw-socket egress. The response is wrapped in hand-built IPv4 + UDP
/// headers whose source is the resolver address the client originally
/// queried, so the reply is indistinguishable from one that resolver sent.
/// Requires CAP_NET_RAW.
pub struct RawSender {
    socket: Socket,
}

impl RawSender {
    pub fn new() -> anyhow::Result<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .context("create raw socket (requires CAP_NET_RAW)")?;
        socket
            .set_header_included_v4(true)
            .context("set IP_HDRINCL")?;
        Ok(Self { socket })
    }

    /// One sendto syscall; raw datagram sends do not short-write.
    pub fn send(
        &self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> io::Result<()> {
        let packet = build_ipv4_udp(src, dst, payload);
        self.socket
            .send_to(&packet, &SocketAddr::V4(dst).into())?;
        Ok(())
    }
}

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// IPv4 header (TTL 64, protocol 17) + UDP header + payload. The kernel
/// recomputes total length and the IP checksum for IP_HDRINCL sockets, but
/// both are filled in anyway so the packet stands on its own.
fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut packet = Vec::with_capacity(total_len);

    packet.push(0x45); // version 4, IHL 5
    packet.push(0x00); // DSCP/ECN
    packet.extend_from_slice(&(total_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // identification
    packet.extend_from_slice(&[0x00, 0x00]); // flags + fragment offset
    packet.push(64); // TTL
    packet.push(17); // UDP
    packet.extend_from_slice(&[0x00, 0x00]); // header checksum, below
    packet.extend_from_slice(&src.ip().octets());
    packet.extend_from_slice(&dst.ip().octets());
    let ip_sum = ones_complement_sum(&packet[..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let udp_at = packet.len();
    packet.extend_from_slice(&src.port().to_be_bytes());
    packet.extend_from_slice(&dst.port().to_be_bytes());
    packet.extend_from_slice(&(udp_len as u16).to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // checksum, below
    packet.extend_from_slice(payload);
    let sum = udp_checksum(*src.ip(), *dst.ip(), &packet[udp_at..]);
    packet[udp_at + 6..udp_at + 8].copy_from_slice(&sum.to_be_bytes());

    packet
}

/// RFC 768 checksum over the IPv4 pseudo-header plus the UDP segment.
/// A computed 0 is transmitted as 0xFFFF (0 on the wire means "no checksum").
fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(17);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    let sum = ones_complement_sum(&pseudo);
    if sum == 0 {
        0xFFFF
    } else {
        sum
    }
}

/// Sum 16-bit big-endian words (odd trailing byte padded as the high byte),
/// fold the carries twice, complement.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Classic IPv4 header example: checksum field must come out 0xB861.
    #[test]
    fn ones_complement_sum_matches_canonical_vector() {
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xC0, 0xA8,
            0x00, 0x01, 0xC0, 0xA8, 0x00, 0xC7,
        ];
        assert_eq!(ones_complement_sum(&header), 0xB861);
    }

    #[test]
    fn ones_complement_sum_pads_odd_length() {
        // 0x0100 + 0x0200 (padded) = 0x0300 -> complement 0xFCFF
        assert_eq!(ones_complement_sum(&[0x01, 0x00, 0x02]), 0xFCFF);
    }

    #[test]
    fn udp_checksum_zero_becomes_all_ones() {
        // The pseudo-header alone sums to S; a two-byte payload word chosen
        // as the complement of S drives the folded sum to 0xFFFF, whose
        // complement is 0 -> must be emitted as 0xFFFF.
        let src = Ipv4Addr::new(0, 0, 0, 0);
        let dst = Ipv4Addr::new(0, 0, 0, 0);
        // pseudo header: zeros + proto 17 + len 2 => 0x0011 + 0x0002 = 0x0013
        // segment word 0xFFEC complements it to 0xFFFF
        let segment = [0xFF, 0xEC];
        assert_eq!(udp_checksum(src, dst, &segment), 0xFFFF);
    }

    #[test]
    fn udp_checksum_verifies_over_pseudo_header() {
        let src = Ipv4Addr::new(8, 8, 8, 8);
        let dst = Ipv4Addr::new(192, 168, 0, 7);
        let mut segment = Vec::new();
        segment.extend_from_slice(&53u16.to_be_bytes());
        segment.extend_from_slice(&51511u16.to_be_bytes());
        segment.extend_from_slice(&13u16.to_be_bytes()); // 8 header + 5 payload
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(b"hello");
        let sum = udp_checksum(src, dst, &segment);
        // re-inserting the checksum must make the datagram verify (sum 0)
        segment[6..8].copy_from_slice(&sum.to_be_bytes());
        let mut check = Vec::new();
        check.extend_from_slice(&src.octets());
        check.extend_from_slice(&dst.octets());
        check.push(0);
        check.push(17);
        check.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        check.extend_from_slice(&segment);
        assert_eq!(ones_complement_sum(&check), 0);
    }

    #[test]
    fn built_packet_has_expected_headers() {
        let src = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let payload = b"response";
        let packet = build_ipv4_udp(src, dst, payload);

        assert_eq!(packet.len(), 20 + 8 + payload.len());
        assert_eq!(packet[0], 0x45);
        assert_eq!(
            u16::from_be_bytes([packet[2], packet[3]]) as usize,
            packet.len()
        );
        assert_eq!(packet[8], 64); // TTL
        assert_eq!(packet[9], 17); // UDP
        assert_eq!(&packet[12..16], &[8, 8, 8, 8]);
        assert_eq!(&packet[16..20], &[10, 0, 0, 2]);
        // IP header checksum verifies
        assert_eq!(ones_complement_sum(&packet[..20]), 0);

        assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 53);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 40000);
        assert_eq!(
            u16::from_be_bytes([packet[24], packet[25]]) as usize,
            8 + payload.len()
        );
        assert_eq!(&packet[28..], payload);
    }
}
