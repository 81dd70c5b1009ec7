use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/multidns/multidns.yaml";

const LISTEN_PORT_BASE: u16 = 32000;
const SOCKS_PORT_BASE: u16 = 31000;

/// 每个转发实例一段配置 / one forwarder instance per entry
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 0..=999; derives both the listen port and the SOCKS port.
    pub segment: u16,
    /// Enables domestic/foreign classification. When false every query takes
    /// the foreign (SOCKS5) path.
    #[serde(default)]
    pub stream_split: bool,
    /// Hint: carry foreign UDP queries over the stream transports instead of
    /// a SOCKS5 UDP association.
    #[serde(default)]
    pub stream_uot: bool,
}

impl ServerConfig {
    pub fn listen_port(&self) -> u16 {
        LISTEN_PORT_BASE + self.segment
    }

    pub fn socks_port(&self) -> u16 {
        SOCKS_PORT_BASE + self.segment
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressList {
    #[serde(default)]
    pub address: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    /// Cache capacity in megabytes, interpreted as a raw cost ceiling.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default)]
    pub upstream_cn: AddressList,
    #[serde(default)]
    pub upstream_non_cn: AddressList,
    pub cn_domain_file: PathBuf,
}

fn default_capacity() -> u64 {
    64
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read configuration {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.servers.is_empty() {
        bail!("no servers configured");
    }
    for server in &config.servers {
        if server.segment > 999 {
            bail!("segment {} out of range 0..=999", server.segment);
        }
    }
    if config.upstream_cn.address.is_empty() && config.upstream_non_cn.address.is_empty() {
        bail!("no upstream resolvers configured");
    }
    if config.capacity == 0 {
        bail!("capacity must be at least 1 MB");
    }
    Ok(())
}
