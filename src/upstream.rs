use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::socks::{self, Target};
use crate::tls;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
const MAX_UDP_RESPONSE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Udp,
    Tcp,
    Tls,
    Doh,
}

impl Method {
    const ALL: [Method; 4] = [Method::Udp, Method::Tcp, Method::Tls, Method::Doh];

    fn canonical_port(self) -> u16 {
        match self {
            Method::Udp | Method::Tcp => 53,
            Method::Tls => 853,
            Method::Doh => 443,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Method::Udp => "UDP",
            Method::Tcp => "TCP",
            Method::Tls => "TLS",
            Method::Doh => "DoH",
        }
    }
}

/// One configured resolver. Entries are bare IPs or hostnames and get each
/// method's canonical port; an explicit `host:port` is used verbatim.
#[derive(Debug, Clone)]
struct Upstream {
    /// As written in the config; keys the DoH client maps.
    entry: String,
    host: String,
    port: Option<u16>,
}

fn parse_upstream(entry: &str) -> Upstream {
    if let Some((host, port)) = entry.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Upstream {
                    entry: entry.to_string(),
                    host: host.to_string(),
                    port: Some(port),
                };
            }
        }
    }
    Upstream {
        entry: entry.to_string(),
        host: entry.to_string(),
        port: None,
    }
}

/// Pooled DoH clients for the direct (domestic) path, one per upstream.
/// Built once at startup and shared by every forwarder instance.
pub fn build_direct_http_clients(
    upstreams: &[String],
) -> anyhow::Result<HashMap<String, reqwest::Client>> {
    let mut clients = HashMap::new();
    for entry in upstreams {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_idle_timeout(HTTP_IDLE_TIMEOUT)
            .pool_max_idle_per_host(20)
            .build()
            .with_context(|| format!("build doh client for {entry}"))?;
        clients.insert(entry.clone(), client);
    }
    Ok(clients)
}

/// Per-instance upstream racer. Every query fans out to each configured
/// resolver over UDP, TCP, DoT and DoH concurrently; the first successful
/// response wins and the siblings are cancelled. Domestic queries dial
/// directly, foreign ones go through the instance's SOCKS5 proxy.
pub struct UpstreamPool {
    cn: Vec<Upstream>,
    noncn: Vec<Upstream>,
    socks_port: u16,
    socks_proxy: SocketAddr,
    /// When set, foreign UDP rides the stream transports instead of a
    /// SOCKS5 UDP association.
    stream_uot: bool,
    tls_connector: TlsConnector,
    http_direct: Arc<HashMap<String, reqwest::Client>>,
    http_proxied: HashMap<String, reqwest::Client>,
}

impl UpstreamPool {
    pub fn new(
        upstream_cn: &[String],
        upstream_noncn: &[String],
        socks_port: u16,
        stream_uot: bool,
        http_direct: Arc<HashMap<String, reqwest::Client>>,
    ) -> anyhow::Result<Self> {
        let socks_proxy = SocketAddr::from(([127, 0, 0, 1], socks_port));
        let proxy_url = format!("socks5h://127.0.0.1:{socks_port}");
        let mut http_proxied = HashMap::new();
        for entry in upstream_noncn {
            let client = reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .pool_idle_timeout(HTTP_IDLE_TIMEOUT)
                .pool_max_idle_per_host(5)
                .proxy(
                    reqwest::Proxy::all(&proxy_url)
                        .with_context(|| format!("socks5 proxy {proxy_url}"))?,
                )
                .build()
                .with_context(|| format!("build proxied doh client for {entry}"))?;
            http_proxied.insert(entry.clone(), client);
        }
        Ok(Self {
            cn: upstream_cn.iter().map(|e| parse_upstream(e)).collect(),
            noncn: upstream_noncn.iter().map(|e| parse_upstream(e)).collect(),
            socks_port,
            socks_proxy,
            stream_uot,
            tls_connector: TlsConnector::from(tls::insecure_client_config()),
            http_direct,
            http_proxied,
        })
    }

    /// Race all (resolver, method) pairs; first success wins, the shared
    /// token cancels the rest. Errors only when every attempt failed.
    pub async fn race(
        self: &Arc<Self>,
        query: Bytes,
        is_cn: bool,
    ) -> anyhow::Result<(Bytes, Arc<str>)> {
        let servers = if is_cn { &self.cn } else { &self.noncn };
        if servers.is_empty() {
            bail!(
                "no upstream resolvers configured for the {} path",
                if is_cn { "domestic" } else { "foreign" }
            );
        }

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(servers.len() * Method::ALL.len());
        let mut attempts = 0usize;

        for upstream in servers {
            for method in Method::ALL {
                if !is_cn && self.stream_uot && method == Method::Udp {
                    continue;
                }
                attempts += 1;
                let tag: Arc<str> = Arc::from(self.tag(method, upstream, is_cn));
                let pool = Arc::clone(self);
                let upstream = upstream.clone();
                let query = query.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = pool.attempt(method, &upstream, &query, is_cn) => result,
                    };
                    let result = result
                        .map(|bytes| (bytes, Arc::clone(&tag)))
                        .map_err(|err| err.context(tag.to_string()));
                    // capacity covers every attempt; a closed channel just
                    // means the race is already decided
                    let _ = tx.try_send(result);
                });
            }
        }
        drop(tx);

        let mut failures = 0usize;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(winner) => {
                    cancel.cancel();
                    return Ok(winner);
                }
                Err(err) => {
                    failures += 1;
                    debug!(error = %err, "upstream attempt failed");
                }
            }
        }
        bail!("all {failures}/{attempts} upstream attempts failed")
    }

    fn tag(&self, method: Method, upstream: &Upstream, is_cn: bool) -> String {
        let port = upstream.port.unwrap_or(method.canonical_port());
        if is_cn {
            format!("{} {}:{}", method.label(), upstream.host, port)
        } else {
            format!(
                "SOCKS5_{} {} {}:{}",
                self.socks_port,
                method.label(),
                upstream.host,
                port
            )
        }
    }

    async fn attempt(
        &self,
        method: Method,
        upstream: &Upstream,
        query: &[u8],
        is_cn: bool,
    ) -> anyhow::Result<Bytes> {
        let port = upstream.port.unwrap_or(method.canonical_port());
        match method {
            Method::Udp => {
                if is_cn {
                    self.query_udp_direct(&upstream.host, port, query).await
                } else {
                    self.query_udp_socks(&upstream.host, port, query).await
                }
            }
            Method::Tcp => {
                let stream = self.dial(&upstream.host, port, is_cn).await?;
                exchange_framed(stream, query).await
            }
            Method::Tls => {
                let tcp = self.dial(&upstream.host, port, is_cn).await?;
                let name = ServerName::try_from(upstream.host.clone())
                    .with_context(|| format!("tls server name {}", upstream.host))?;
                let stream = timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    self.tls_connector.connect(name, tcp),
                )
                .await
                .context("tls handshake timed out")??;
                exchange_framed(stream, query).await
            }
            Method::Doh => self.query_doh(upstream, port, query, is_cn).await,
        }
    }

    async fn dial(&self, host: &str, port: u16, is_cn: bool) -> anyhow::Result<TcpStream> {
        if is_cn {
            TcpStream::connect((host, port))
                .await
                .with_context(|| format!("connect {host}:{port}"))
        } else {
            let target = Target::parse(host, port)?;
            socks::connect(self.socks_proxy, &target).await
        }
    }

    async fn query_udp_direct(&self, host: &str, port: u16, query: &[u8]) -> anyhow::Result<Bytes> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((host, port))
            .await
            .with_context(|| format!("udp connect {host}:{port}"))?;
        socket.send(query).await?;

        let mut buf = [0u8; MAX_UDP_RESPONSE];
        let received = timeout(READ_TIMEOUT, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // the socket is connected, but a late duplicate from an
                // earlier query could still carry the wrong transaction id
                if len >= 2 && query.len() >= 2 && buf[..2] != query[..2] {
                    continue;
                }
                return Ok::<usize, anyhow::Error>(len);
            }
        })
        .await
        .context("udp read timed out")??;
        Ok(Bytes::copy_from_slice(&buf[..received]))
    }

    async fn query_udp_socks(&self, host: &str, port: u16, query: &[u8]) -> anyhow::Result<Bytes> {
        let target = Target::parse(host, port)?;
        let association = socks::UdpAssociation::open(self.socks_proxy).await?;
        association.send(query, &target).await?;
        timeout(READ_TIMEOUT, association.recv())
            .await
            .context("socks5 udp read timed out")?
    }

    async fn query_doh(
        &self,
        upstream: &Upstream,
        port: u16,
        query: &[u8],
        is_cn: bool,
    ) -> anyhow::Result<Bytes> {
        let clients = if is_cn {
            self.http_direct.as_ref()
        } else {
            &self.http_proxied
        };
        let client = clients
            .get(&upstream.entry)
            .ok_or_else(|| anyhow!("no doh client for {}", upstream.entry))?;
        let url = if port == 443 {
            format!("https://{}/dns-query", upstream.host)
        } else {
            format!("https://{}:{}/dns-query", upstream.host, port)
        };

        let response = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
            .header(reqwest::header::ACCEPT, "application/dns-message")
            .body(query.to_vec())
            .send()
            .await
            .context("doh request failed")?;
        if !response.status().is_success() {
            bail!("doh server returned {}", response.status());
        }
        let body = response.bytes().await.context("read doh body")?;
        Ok(body)
    }
}

/// DNS over a stream transport: 2-byte big-endian length prefix both ways.
async fn exchange_framed<S>(mut stream: S, query: &[u8]) -> anyhow::Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if query.len() > u16::MAX as usize {
        bail!("query too large for stream transport");
    }
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .context("stream read timed out")??;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        bail!("empty response frame");
    }
    let mut body = vec![0u8; len];
    timeout(READ_TIMEOUT, stream.read_exact(&mut body))
        .await
        .context("stream read timed out")??;
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration, Instant};

    fn pool(cn: &[String]) -> Arc<UpstreamPool> {
        let direct = Arc::new(build_direct_http_clients(cn).unwrap());
        Arc::new(UpstreamPool::new(cn, &[], 31001, false, direct).unwrap())
    }

    #[test]
    fn parse_upstream_splits_optional_port() {
        let bare = parse_upstream("8.8.8.8");
        assert_eq!(bare.host, "8.8.8.8");
        assert_eq!(bare.port, None);

        let explicit = parse_upstream("127.0.0.1:5353");
        assert_eq!(explicit.host, "127.0.0.1");
        assert_eq!(explicit.port, Some(5353));

        // ipv6 literals keep their colons
        let v6 = parse_upstream("2001:db8::1");
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.port, None);
    }

    #[test]
    fn tags_identify_method_path_and_socks_port() {
        let pool = pool(&["8.8.8.8".to_string()]);
        let upstream = parse_upstream("8.8.8.8");
        assert_eq!(pool.tag(Method::Udp, &upstream, true), "UDP 8.8.8.8:53");
        assert_eq!(pool.tag(Method::Tls, &upstream, true), "TLS 8.8.8.8:853");
        assert_eq!(
            pool.tag(Method::Doh, &upstream, false),
            "SOCKS5_31001 DoH 8.8.8.8:443"
        );
    }

    #[tokio::test]
    async fn race_fails_without_resolvers() {
        let pool = pool(&[]);
        let err = pool
            .race(Bytes::from_static(&[0u8; 12]), true)
            .await
            .expect_err("empty resolver list");
        assert!(err.to_string().contains("no upstream resolvers"));
    }

    /// Echoing UDP responder; replies after `delay`.
    async fn spawn_responder(delay: Duration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                sleep(delay).await;
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn race_returns_first_success_without_waiting_for_slow_sibling() {
        let fast = spawn_responder(Duration::from_millis(0)).await;
        let slow = spawn_responder(Duration::from_millis(1500)).await;
        let upstreams = vec![format!("127.0.0.1:{}", slow.port()), format!("127.0.0.1:{}", fast.port())];
        let pool = pool(&upstreams);

        let query = Bytes::from_static(&[0xAB, 0xCD, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        let started = Instant::now();
        let (bytes, tag) = pool.race(query.clone(), true).await.expect("race");
        assert_eq!(bytes, query);
        assert_eq!(tag.as_ref(), format!("UDP 127.0.0.1:{}", fast.port()));
        // winner must not be gated on the slow sibling
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn framed_exchange_roundtrips_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            // reply with the same frame
            stream.write_all(&len_buf).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange_framed(stream, b"\x12\x34query").await.expect("exchange");
        assert_eq!(reply, Bytes::from_static(b"\x12\x34query"));
    }
}
