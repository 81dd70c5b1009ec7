use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// RFC 1928 destination address. Upstream resolvers are bare IPv4 addresses
/// or hostnames; IPv6 egress is out of scope.
#[derive(Debug, Clone)]
pub enum Target {
    Ip(SocketAddrV4),
    Domain(String, u16),
}

impl Target {
    pub fn parse(host: &str, port: u16) -> anyhow::Result<Self> {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok(Target::Ip(SocketAddrV4::new(v4, port)));
        }
        if host.parse::<IpAddr>().is_ok() {
            bail!("ipv6 upstream {host} not supported");
        }
        if host.is_empty() || host.len() > 255 {
            bail!("bad upstream host {host:?}");
        }
        Ok(Target::Domain(host.to_string(), port))
    }
}

const VER: u8 = 0x05;
const METHOD_NOAUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// TCP CONNECT through the local SOCKS5 daemon; returns a stream that is
/// already relaying to `target`.
pub async fn connect(proxy: SocketAddr, target: &Target) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .with_context(|| format!("connect socks5 proxy {proxy}"))?;
    handshake(&mut stream).await?;
    request(&mut stream, CMD_CONNECT, target).await?;
    Ok(stream)
}

/// No-auth method negotiation.
async fn handshake(stream: &mut TcpStream) -> anyhow::Result<()> {
    stream.write_all(&[VER, 0x01, METHOD_NOAUTH]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VER {
        bail!("socks5: bad version {:#04x}", reply[0]);
    }
    if reply[1] != METHOD_NOAUTH {
        bail!("socks5: proxy refused no-auth method");
    }
    Ok(())
}

/// Send a CONNECT / UDP ASSOCIATE request and parse the reply, returning
/// BND.ADDR:BND.PORT.
async fn request(
    stream: &mut TcpStream,
    cmd: u8,
    target: &Target,
) -> anyhow::Result<SocketAddr> {
    let mut msg = Vec::with_capacity(22);
    msg.extend_from_slice(&[VER, cmd, 0x00]);
    match target {
        Target::Ip(addr) => {
            msg.push(ATYP_V4);
            msg.extend_from_slice(&addr.ip().octets());
            msg.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Domain(host, port) => {
            msg.push(ATYP_DOMAIN);
            msg.push(host.len() as u8);
            msg.extend_from_slice(host.as_bytes());
            msg.extend_from_slice(&port.to_be_bytes());
        }
    }
    stream.write_all(&msg).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        bail!("socks5: bad reply version {:#04x}", head[0]);
    }
    if head[1] != 0x00 {
        bail!("socks5: request failed, rep={:#04x}", head[1]);
    }

    let bound = match head[3] {
        ATYP_V4 => {
            let mut body = [0u8; 6];
            stream.read_exact(&mut body).await?;
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            SocketAddr::from((ip, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut body = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut body).await?;
            // domain BND.ADDR is useless to us; keep the port, zero the host
            let port = u16::from_be_bytes([body[body.len() - 2], body[body.len() - 1]]);
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
        }
        ATYP_V6 => {
            let mut body = [0u8; 18];
            stream.read_exact(&mut body).await?;
            bail!("socks5: ipv6 relay not supported");
        }
        other => bail!("socks5: bad atyp {other:#04x}"),
    };
    Ok(bound)
}

/// Live UDP ASSOCIATE session. The control connection must stay open for the
/// association's lifetime (RFC 1928 §7), so it rides along here.
pub struct UdpAssociation {
    _control: TcpStream,
    relay: SocketAddr,
    socket: UdpSocket,
}

impl UdpAssociation {
    pub async fn open(proxy: SocketAddr) -> anyhow::Result<Self> {
        let mut control = TcpStream::connect(proxy)
            .await
            .with_context(|| format!("connect socks5 proxy {proxy}"))?;
        handshake(&mut control).await?;
        let placeholder = Target::Ip(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let mut relay = request(&mut control, CMD_UDP_ASSOCIATE, &placeholder).await?;
        // proxies commonly answer 0.0.0.0:<port>; the relay then lives on the
        // proxy's own address
        if relay.ip().is_unspecified() {
            relay.set_ip(proxy.ip());
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            _control: control,
            relay,
            socket,
        })
    }

    pub async fn send(&self, payload: &[u8], target: &Target) -> anyhow::Result<()> {
        let datagram = encode_datagram(target, payload);
        self.socket.send_to(&datagram, self.relay).await?;
        Ok(())
    }

    /// Receive one relayed datagram and strip the SOCKS5 UDP header.
    pub async fn recv(&self) -> anyhow::Result<Bytes> {
        let mut buf = [0u8; 4096];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        let payload = decode_datagram(&buf[..len])?;
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// RSV(2) FRAG(1) ATYP DST.ADDR DST.PORT DATA
fn encode_datagram(target: &Target, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(10 + payload.len());
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    match target {
        Target::Ip(addr) => {
            packet.push(ATYP_V4);
            packet.extend_from_slice(&addr.ip().octets());
            packet.extend_from_slice(&addr.port().to_be_bytes());
        }
        Target::Domain(host, port) => {
            packet.push(ATYP_DOMAIN);
            packet.push(host.len() as u8);
            packet.extend_from_slice(host.as_bytes());
            packet.extend_from_slice(&port.to_be_bytes());
        }
    }
    packet.extend_from_slice(payload);
    packet
}

fn decode_datagram(packet: &[u8]) -> anyhow::Result<&[u8]> {
    if packet.len() < 7 {
        bail!("socks5: udp reply too short");
    }
    if packet[2] != 0x00 {
        bail!("socks5: fragmented udp reply not supported");
    }
    let offset = match packet[3] {
        ATYP_V4 => 4 + 4 + 2,
        ATYP_DOMAIN => {
            let len = packet[4] as usize;
            4 + 1 + len + 2
        }
        ATYP_V6 => 4 + 16 + 2,
        other => bail!("socks5: bad udp atyp {other:#04x}"),
    };
    packet
        .get(offset..)
        .ok_or_else(|| anyhow!("socks5: truncated udp reply"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn encode_ip_datagram_layout() {
        let target = Target::Ip(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));
        let packet = encode_datagram(&target, b"abc");
        assert_eq!(&packet[..4], &[0, 0, 0, ATYP_V4]);
        assert_eq!(&packet[4..8], &[8, 8, 8, 8]);
        assert_eq!(&packet[8..10], &53u16.to_be_bytes());
        assert_eq!(&packet[10..], b"abc");
    }

    #[test]
    fn encode_domain_datagram_layout() {
        let target = Target::Domain("dns.google".into(), 443);
        let packet = encode_datagram(&target, b"q");
        assert_eq!(&packet[..4], &[0, 0, 0, ATYP_DOMAIN]);
        assert_eq!(packet[4] as usize, "dns.google".len());
        assert_eq!(&packet[5..15], b"dns.google");
        assert_eq!(&packet[15..17], &443u16.to_be_bytes());
        assert_eq!(&packet[17..], b"q");
    }

    #[test]
    fn decode_rejects_short_and_fragmented() {
        assert!(decode_datagram(&[0, 0, 0]).is_err());
        let target = Target::Ip(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53));
        let mut packet = encode_datagram(&target, b"xyz");
        packet[2] = 1; // FRAG
        assert!(decode_datagram(&packet).is_err());
    }

    #[test]
    fn decode_roundtrips_both_atyps() {
        let ip = Target::Ip(SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 853));
        assert_eq!(decode_datagram(&encode_datagram(&ip, b"payload")).unwrap(), b"payload");
        let domain = Target::Domain("dns.example".into(), 443);
        assert_eq!(decode_datagram(&encode_datagram(&domain, b"p2")).unwrap(), b"p2");
    }

    #[test]
    fn target_parse_classifies_hosts() {
        assert!(matches!(Target::parse("8.8.8.8", 53).unwrap(), Target::Ip(_)));
        assert!(matches!(
            Target::parse("dns.google", 443).unwrap(),
            Target::Domain(_, 443)
        ));
        assert!(Target::parse("2001:db8::1", 53).is_err());
    }

    #[tokio::test]
    async fn connect_performs_rfc1928_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VER, 0x01, METHOD_NOAUTH]);
            stream.write_all(&[VER, METHOD_NOAUTH]).await.unwrap();

            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [VER, CMD_CONNECT, 0x00, ATYP_V4]);
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..4], &[9, 9, 9, 9]);
            assert_eq!(u16::from_be_bytes([rest[4], rest[5]]), 853);

            stream
                .write_all(&[VER, 0x00, 0x00, ATYP_V4, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
            // keep the stream open until the client is done
            let mut one = [0u8; 1];
            let _ = stream.read(&mut one).await;
        });

        let target = Target::Ip(SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 853));
        let stream = connect(proxy, &target).await.expect("connect");
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_surfaces_proxy_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            // 0xFF: no acceptable methods
            stream.write_all(&[VER, 0xFF]).await.unwrap();
        });

        let target = Target::Ip(SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 53));
        let err = connect(proxy, &target).await.expect_err("must refuse");
        assert!(err.to_string().contains("no-auth"));
    }
}
