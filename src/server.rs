use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::rr::RecordType;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, SharedCache};
use crate::config::ServerConfig;
use crate::matcher::DomainSuffixSet;
use crate::proto;
use crate::socket::{RawSender, TransparentSocket};
use crate::upstream::UpstreamPool;

/// Bound on concurrently processed datagrams per instance; the kernel UDP
/// buffer absorbs bursts beyond it.
const MAX_INFLIGHT: usize = 100;

const RECV_BUFFER: usize = 4096;

/// Spoof source when the kernel did not hand us the original destination.
const FALLBACK_SPOOF_SOURCE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

/// One forwarder instance: transparent ingress on `32000+segment`, foreign
/// egress through the SOCKS5 proxy on `31000+segment`, spoofed raw-socket
/// replies, all instances sharing one cache under distinct tenants.
pub struct DnsServer {
    tenant: Arc<str>,
    stream_split: bool,
    listen_port: u16,
    cache: SharedCache,
    cn_domains: Arc<DomainSuffixSet>,
    upstreams: Arc<UpstreamPool>,
    ingress: TransparentSocket,
    egress: RawSender,
}

impl DnsServer {
    /// Binds the transparent socket and opens the raw egress socket up
    /// front, so permission problems abort startup instead of surfacing on
    /// the first query.
    pub fn new(
        config: &ServerConfig,
        cache: SharedCache,
        cn_domains: Arc<DomainSuffixSet>,
        upstreams: Arc<UpstreamPool>,
    ) -> anyhow::Result<Self> {
        let listen_port = config.listen_port();
        let ingress = TransparentSocket::bind(listen_port)?;
        let egress = RawSender::new()?;
        Ok(Self {
            tenant: Arc::from(format!("cache_{listen_port}")),
            stream_split: config.stream_split,
            listen_port,
            cache,
            cn_domains,
            upstreams,
            ingress,
            egress,
        })
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(port = self.listen_port, tenant = %self.tenant, "transparent dns forwarder started");
        let limiter = Arc::new(Semaphore::new(MAX_INFLIGHT));
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            let (len, peer, original_dst) = match self.ingress.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(port = self.listen_port, error = %err, "ingress read failed");
                    continue;
                }
            };

            let permit = match Arc::clone(&limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed: shutting down
            };
            let packet = Bytes::copy_from_slice(&buf[..len]);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                server.handle_query(packet, peer, original_dst).await;
            });
        }
        Ok(())
    }

    async fn handle_query(
        &self,
        packet: Bytes,
        peer: SocketAddr,
        original_dst: Option<SocketAddrV4>,
    ) {
        let started = Instant::now();

        let client = match peer {
            SocketAddr::V4(v4) => v4,
            // raw spoofed egress is IPv4 only
            SocketAddr::V6(_) => return,
        };

        let mut name_buf = [0u8; 256];
        let (tx_id, qd_count, qname, qtype) =
            match proto::parse_quick(&packet, &mut name_buf) {
                Some(q) => (
                    q.tx_id,
                    q.qd_count,
                    Arc::<str>::from(q.qname),
                    RecordType::from(q.qtype),
                ),
                None => {
                    // malformed or question-less; drop silently
                    debug!(port = self.listen_port, %peer, len = packet.len(), "dropping unparseable datagram");
                    return;
                }
            };

        let spoof_source = original_dst.unwrap_or(FALLBACK_SPOOF_SOURCE);
        let is_cn = self.stream_split && self.cn_domains.matches(&qname);

        if qd_count > 1 {
            self.handle_multi_question(packet, client, spoof_source, tx_id, &qname, is_cn, started)
                .await;
            return;
        }

        let key = CacheKey::new(Arc::clone(&self.tenant), qtype, &qname);
        let upstreams = Arc::clone(&self.upstreams);
        let query = packet.clone();
        let produce = move || async move { upstreams.race(query, is_cn).await };

        let (bytes, remaining_ttl, source) = match self.cache.get_or_update(key, produce).await {
            Ok(served) => served,
            Err(err) => {
                warn!(
                    domain = %qname,
                    qtype = %qtype,
                    is_cn,
                    error = %err,
                    "upstream race failed, dropping query"
                );
                return;
            }
        };

        let response = match proto::seal_response(&bytes, tx_id, remaining_ttl) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(domain = %qname, error = %err, "unusable upstream response");
                return;
            }
        };

        if let Err(err) = self.egress.send(spoof_source, client, &response) {
            warn!(domain = %qname, client = %client, error = %err, "spoofed send failed");
            return;
        }

        info!(
            event = "dns_response",
            domain = %qname,
            qtype = %qtype,
            source = %source,
            ttl = remaining_ttl,
            latency_ms = started.elapsed().as_millis() as u64,
            "served"
        );
    }

    /// Queries with more than one question are rare and bypass the cache:
    /// one upstream race, transaction-id rewrite only, TTLs untouched.
    #[allow(clippy::too_many_arguments)]
    async fn handle_multi_question(
        &self,
        packet: Bytes,
        client: SocketAddrV4,
        spoof_source: SocketAddrV4,
        tx_id: u16,
        qname: &str,
        is_cn: bool,
        started: Instant,
    ) {
        let (bytes, source) = match self.upstreams.race(packet, is_cn).await {
            Ok(raced) => raced,
            Err(err) => {
                warn!(domain = %qname, error = %err, "multi-question race failed, dropping query");
                return;
            }
        };

        let mut response = bytes.to_vec();
        proto::patch_id(&mut response, tx_id);

        if let Err(err) = self.egress.send(spoof_source, client, &response) {
            warn!(domain = %qname, client = %client, error = %err, "spoofed send failed");
            return;
        }

        info!(
            event = "dns_response",
            domain = %qname,
            source = %source,
            multi_question = true,
            latency_ms = started.elapsed().as_millis() as u64,
            "served"
        );
    }
}
