//! 全局配置
//!
//! TOML 文件，所有字段都有默认值；文件不存在时直接使用默认配置。

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tun::packet::MAX_UDP_PAYLOAD;

/// 全局配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 上游代理设置
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// TUN 设备设置
    #[serde(default)]
    pub tun: TunSettings,

    /// 进程归属缓存设置
    #[serde(default)]
    pub cache: CacheConfig,

    /// Socket 读写设置
    #[serde(default)]
    pub io: IoConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 上游代理地址，未配置时所有连接直连
    #[serde(default)]
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    /// TUN 设备名称
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// TUN 设备 IP 地址
    #[serde(default = "default_tun_address")]
    pub address: Ipv4Addr,

    /// 子网掩码
    #[serde(default = "default_tun_netmask")]
    pub netmask: Ipv4Addr,

    /// MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 本地端口 -> 连接信息 的存活时间（秒）
    #[serde(default = "default_network_ttl")]
    pub network_ttl_secs: u64,

    /// uid -> 进程信息 的存活时间（秒）
    #[serde(default = "default_process_ttl")]
    pub process_ttl_secs: u64,

    /// 每个缓存的最大条目数
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// TCP 单次读取上限，接近典型 MTU
    #[serde(default = "default_tcp_read_ceiling")]
    pub tcp_read_ceiling: usize,

    /// UDP 单次读取上限
    #[serde(default = "default_udp_read_ceiling")]
    pub udp_read_ceiling: usize,

    /// TUN 写队列长度
    #[serde(default = "default_writer_queue")]
    pub writer_queue: usize,

    /// 每个连接已确认但未写出的客户端数据上限，超出时不再确认
    #[serde(default = "default_max_pending_upstream")]
    pub max_pending_upstream: usize,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            netmask: default_tun_netmask(),
            mtu: default_mtu(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            network_ttl_secs: default_network_ttl(),
            process_ttl_secs: default_process_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn network_ttl(&self) -> Duration {
        Duration::from_secs(self.network_ttl_secs)
    }

    pub fn process_ttl(&self) -> Duration {
        Duration::from_secs(self.process_ttl_secs)
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            tcp_read_ceiling: default_tcp_read_ceiling(),
            udp_read_ceiling: default_udp_read_ceiling(),
            writer_queue: default_writer_queue(),
            max_pending_upstream: default_max_pending_upstream(),
        }
    }
}

// 默认值函数
fn default_tun_name() -> String {
    "tun0".to_string()
}

fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn default_tun_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_mtu() -> u16 {
    1500
}

fn default_network_ttl() -> u64 {
    60
}

fn default_process_ttl() -> u64 {
    300
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_tcp_read_ceiling() -> usize {
    1480
}

fn default_udp_read_ceiling() -> usize {
    65507
}

fn default_writer_queue() -> usize {
    4096
}

fn default_max_pending_upstream() -> usize {
    1 << 20
}

impl Config {
    /// 默认配置文件路径
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("com", "tunflow", "tunflow")
            .ok_or_else(|| Error::Config("cannot determine config directory".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// 加载配置；未指定路径时使用默认路径
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        if config.io.tcp_read_ceiling == 0 || config.io.udp_read_ceiling == 0 {
            return Err(Error::Config("read ceilings must be non-zero".into()));
        }
        if config.io.udp_read_ceiling > MAX_UDP_PAYLOAD {
            tracing::warn!(
                "udp_read_ceiling {} exceeds {}, clamping",
                config.io.udp_read_ceiling,
                MAX_UDP_PAYLOAD
            );
            config.io.udp_read_ceiling = MAX_UDP_PAYLOAD;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.proxy.address.is_none());
        assert_eq!(config.tun.name, "tun0");
        assert_eq!(config.cache.network_ttl_secs, 60);
        assert_eq!(config.cache.process_ttl_secs, 300);
        assert_eq!(config.io.tcp_read_ceiling, 1480);
        assert_eq!(config.io.udp_read_ceiling, 65507);
        assert_eq!(config.io.max_pending_upstream, 1 << 20);
    }

    #[test]
    fn test_partial_config() {
        let config = Config::from_toml(
            r#"
            [proxy]
            address = "127.0.0.1:9099"

            [cache]
            network_ttl_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.address, Some("127.0.0.1:9099".parse().unwrap()));
        assert_eq!(config.cache.network_ttl_secs, 30);
        assert_eq!(config.cache.max_entries, 10_000);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        assert!(Config::from_toml("[io]\ntcp_read_ceiling = 0").is_err());
    }

    #[test]
    fn test_udp_ceiling_clamped() {
        let config = Config::from_toml("[io]\nudp_read_ceiling = 70000").unwrap();
        assert_eq!(config.io.udp_read_ceiling, MAX_UDP_PAYLOAD);
    }
}
