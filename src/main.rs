mod cache;
mod config;
mod matcher;
mod proto;
mod server;
mod socket;
mod socks;
mod tls;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::SharedCache;
use crate::matcher::DomainSuffixSet;
use crate::server::DnsServer;
use crate::upstream::UpstreamPool;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent split-horizon DNS forwarder", long_about = None)]
struct Args {
    /// 配置文件路径（YAML）
    #[arg(short = 'c', long = "config", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = config::load_config(&args.config).context("load configuration")?;

    let cn_domains = Arc::new(
        DomainSuffixSet::load(&cfg.cn_domain_file).context("load domain suffix list")?,
    );
    if cn_domains.is_empty() {
        tracing::warn!(
            file = %cfg.cn_domain_file.display(),
            "domain suffix list is empty, every query will take the foreign path"
        );
    }
    info!(
        file = %cfg.cn_domain_file.display(),
        entries = cn_domains.len(),
        "domain suffix list loaded"
    );

    // 所有实例共享一个缓存，租户按监听端口区分 / one cache shared by every
    // instance, tenants keyed by listen port
    let cache = SharedCache::new(cfg.capacity << 20);
    info!(capacity_mb = cfg.capacity, "shared cache created");

    // direct DoH clients are shared; each instance gets its own SOCKS5 set
    let http_direct = Arc::new(
        upstream::build_direct_http_clients(&cfg.upstream_cn.address)
            .context("build domestic doh clients")?,
    );

    let mut instances = Vec::with_capacity(cfg.servers.len());
    for server_cfg in &cfg.servers {
        let pool = Arc::new(
            UpstreamPool::new(
                &cfg.upstream_cn.address,
                &cfg.upstream_non_cn.address,
                server_cfg.socks_port(),
                server_cfg.stream_uot,
                Arc::clone(&http_direct),
            )
            .with_context(|| format!("build upstream pool for segment {}", server_cfg.segment))?,
        );
        let instance = Arc::new(
            DnsServer::new(server_cfg, cache.clone(), Arc::clone(&cn_domains), pool)
                .with_context(|| format!("start segment {}", server_cfg.segment))?,
        );
        info!(
            segment = server_cfg.segment,
            listen_port = server_cfg.listen_port(),
            socks_port = server_cfg.socks_port(),
            stream_split = server_cfg.stream_split,
            "instance configured"
        );
        instances.push(instance);
    }

    let mut handles = Vec::with_capacity(instances.len());
    for instance in instances {
        handles.push(tokio::spawn(async move {
            if let Err(err) = instance.run().await {
                error!(error = %err, "forwarder instance exited");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
