//! 进程归属缓存
//!
//! 两级缓存：
//! - 本地端口 -> 连接信息（uid、远端地址），默认 60 秒过期
//! - uid -> 进程信息，默认 300 秒过期
//!
//! 两级都有容量上限，过期条目在读取时不可见，并由后台任务定期清理。

mod provider;

pub use provider::{select_provider, OwnerProvider, ProcNetProvider, UnavailableProvider};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::tun::Connection;

/// 进程信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub uid: u32,
    /// 账户 / 包名
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 查询结果附带的远端地址
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
}

impl ProcessInfo {
    pub fn with_remote(mut self, host: String, port: u16) -> Self {
        self.remote_host = Some(host);
        self.remote_port = Some(port);
        self
    }
}

/// 本地端口对应的连接信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub uid: u32,
    pub remote_host: String,
    pub remote_port: u16,
}

/// 远端地址查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAddress {
    pub remote_host: String,
    pub remote_port: u16,
}

/// 进程归属缓存
pub struct AttributionCache {
    local_ports: Cache<u16, NetworkInfo>,
    processes: Cache<u32, ProcessInfo>,
    provider: Arc<dyn OwnerProvider>,
    /// 缓存未命中时按 (host:port, 代理地址) 解析
    proxy_addr: Option<SocketAddr>,
}

impl AttributionCache {
    pub fn new(config: &CacheConfig, provider: Arc<dyn OwnerProvider>, proxy_addr: Option<SocketAddr>) -> Self {
        Self::with_ttl(
            config.network_ttl(),
            config.process_ttl(),
            config.max_entries,
            provider,
            proxy_addr,
        )
    }

    pub fn with_ttl(
        network_ttl: Duration,
        process_ttl: Duration,
        max_entries: u64,
        provider: Arc<dyn OwnerProvider>,
        proxy_addr: Option<SocketAddr>,
    ) -> Self {
        tracing::debug!("Attribution cache using {} provider", provider.name());
        Self {
            local_ports: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(network_ttl)
                .build(),
            processes: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(process_ttl)
                .build(),
            provider,
            proxy_addr,
        }
    }

    /// 记录连接所属 uid，以真实 socket 的本地端口为键
    pub fn record_owner(&self, conn: &Connection, uid: u32) {
        let Some(port) = conn.local_port() else {
            tracing::debug!("No local port for {}, skipping owner {}", conn, uid);
            return;
        };
        let remote = conn.key().destination();

        self.local_ports.insert(
            port,
            NetworkInfo {
                uid,
                remote_host: remote.ip().to_string(),
                remote_port: remote.port(),
            },
        );
        tracing::debug!("Connection {} on port {} owned by uid {}", conn, port, uid);
    }

    /// 连接就绪时解析并记录所属进程，失败只记日志
    pub async fn attribute(&self, conn: &Arc<Connection>) {
        let provider = self.provider.clone();
        let (local, remote) = (conn.key().source(), conn.key().destination());

        match tokio::task::spawn_blocking(move || provider.resolve_owner(local, remote)).await {
            Ok(Ok(uid)) => {
                self.record_owner(conn, uid);
                // 关闭先于写入时，remove_on_close 已经执行过
                if conn.is_cancelled() {
                    self.remove_on_close(conn);
                }
            }
            Ok(Err(e)) => tracing::debug!("Owner of {} unknown: {}", conn, e),
            Err(e) => tracing::debug!("Owner lookup task failed: {}", e),
        }
    }

    /// 连接关闭时移除端口记录
    pub fn remove_on_close(&self, conn: &Connection) {
        if let Some(port) = conn.local_port() {
            self.local_ports.invalidate(&port);
        }
    }

    /// 按本地端口查进程
    ///
    /// 先查端口缓存；未命中时若给出 host 且配置了代理，则按 (host:port, 代理) 解析并写入缓存。
    pub async fn lookup_by_port(&self, host: Option<&str>, local_port: u16) -> Option<ProcessInfo> {
        if let Some(net) = self.local_ports.get(&local_port) {
            let info = self.process_info(net.uid).await?;
            return Some(info.with_remote(net.remote_host, net.remote_port));
        }

        if local_port == 0 {
            return None;
        }
        let host = host?;
        let proxy = self.proxy_addr?;
        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::debug!("Invalid host for lookup: {}", host);
                return None;
            }
        };

        let local = SocketAddr::new(ip, local_port);
        let provider = self.provider.clone();
        let uid = match tokio::task::spawn_blocking(move || provider.resolve_owner(local, proxy)).await {
            Ok(Ok(uid)) => uid,
            Ok(Err(e)) => {
                tracing::debug!("Owner of {} unknown: {}", local, e);
                return None;
            }
            Err(e) => {
                tracing::debug!("Owner lookup task failed: {}", e);
                return None;
            }
        };

        let info = self.process_info(uid).await?;
        let net = NetworkInfo {
            uid,
            remote_host: proxy.ip().to_string(),
            remote_port: proxy.port(),
        };
        self.local_ports.insert(local_port, net.clone());

        Some(info.with_remote(net.remote_host, net.remote_port))
    }

    /// 按本地端口查远端地址，只读缓存
    pub fn remote_address_by_port(&self, local_port: u16) -> Option<RemoteAddress> {
        self.local_ports.get(&local_port).map(|net| RemoteAddress {
            remote_host: net.remote_host,
            remote_port: net.remote_port,
        })
    }

    async fn process_info(&self, uid: u32) -> Option<ProcessInfo> {
        if let Some(info) = self.processes.get(&uid) {
            return Some(info);
        }

        let provider = self.provider.clone();
        match tokio::task::spawn_blocking(move || provider.process_info(uid)).await {
            Ok(Ok(info)) => {
                self.processes.insert(uid, info.clone());
                Some(info)
            }
            Ok(Err(e)) => {
                tracing::debug!("Process for uid {} unknown: {}", uid, e);
                None
            }
            Err(e) => {
                tracing::debug!("Process lookup task failed: {}", e);
                None
            }
        }
    }

    /// 清理过期条目
    pub fn run_pending_tasks(&self) {
        self.local_ports.run_pending_tasks();
        self.processes.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::tun::{FlowKey, Protocol, Route};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProvider {
        owners: HashMap<(SocketAddr, SocketAddr), u32>,
        resolves: AtomicUsize,
    }

    impl OwnerProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Result<u32> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            self.owners
                .get(&(local, remote))
                .copied()
                .ok_or_else(|| Error::AttributionUnavailable("not found".into()))
        }

        fn process_info(&self, uid: u32) -> Result<ProcessInfo> {
            Ok(ProcessInfo {
                uid,
                name: format!("app{}", uid),
                display_name: format!("App {}", uid),
                path: None,
                remote_host: None,
                remote_port: None,
            })
        }
    }

    fn proxy() -> SocketAddr {
        "127.0.0.1:9099".parse().unwrap()
    }

    fn cache(provider: Arc<FakeProvider>, ttl: Duration) -> AttributionCache {
        AttributionCache::with_ttl(ttl, Duration::from_secs(300), 100, provider, Some(proxy()))
    }

    fn connection(local_port: u16) -> Arc<Connection> {
        let key = FlowKey::new(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 2), 40000, Ipv4Addr::new(93, 184, 216, 34), 443);
        let conn = Arc::new(Connection::new(key, Route::Direct(key.destination())));
        conn.set_local_port(local_port);
        conn
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let cache = cache(Arc::new(FakeProvider::default()), Duration::from_secs(60));
        let conn = connection(51000);
        cache.record_owner(&conn, 10123);

        let info = cache.lookup_by_port(None, 51000).await.unwrap();
        assert_eq!(info.uid, 10123);
        assert_eq!(info.name, "app10123");
        assert_eq!(info.remote_host.as_deref(), Some("93.184.216.34"));
        assert_eq!(info.remote_port, Some(443));

        let remote = cache.remote_address_by_port(51000).unwrap();
        assert_eq!(remote.remote_host, "93.184.216.34");
        assert_eq!(remote.remote_port, 443);

        cache.remove_on_close(&conn);
        assert!(cache.remote_address_by_port(51000).is_none());
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let provider = Arc::new(FakeProvider::default());
        let cache = cache(provider.clone(), Duration::from_millis(100));
        cache.record_owner(&connection(51001), 10001);
        assert!(cache.remote_address_by_port(51001).is_some());

        // 中途一次失败的解析不影响已有条目，也不写入新条目
        assert!(cache.lookup_by_port(Some("127.0.0.1"), 51009).await.is_none());
        assert_eq!(provider.resolves.load(Ordering::SeqCst), 1);
        assert!(cache.remote_address_by_port(51009).is_none());
        assert!(cache.remote_address_by_port(51001).is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.remote_address_by_port(51001).is_none());
        assert!(cache.lookup_by_port(None, 51001).await.is_none());
    }

    #[tokio::test]
    async fn test_miss_resolves_via_proxy() {
        let mut provider = FakeProvider::default();
        provider.owners.insert(("127.0.0.1:50000".parse().unwrap(), proxy()), 10077);
        let provider = Arc::new(provider);
        let cache = cache(provider.clone(), Duration::from_secs(60));

        let info = cache.lookup_by_port(Some("127.0.0.1"), 50000).await.unwrap();
        assert_eq!(info.uid, 10077);
        assert_eq!(info.remote_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(info.remote_port, Some(9099));

        // 第二次命中缓存
        let again = cache.lookup_by_port(Some("127.0.0.1"), 50000).await.unwrap();
        assert_eq!(again, info);
        assert_eq!(provider.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_miss_without_host_or_port() {
        let provider = Arc::new(FakeProvider::default());
        let cache = cache(provider.clone(), Duration::from_secs(60));

        assert!(cache.lookup_by_port(None, 50000).await.is_none());
        assert!(cache.lookup_by_port(Some("127.0.0.1"), 0).await.is_none());
        assert!(cache.lookup_by_port(Some("not-an-ip"), 50000).await.is_none());
        assert_eq!(provider.resolves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attribute_on_ready() {
        let conn = connection(51002);
        let mut provider = FakeProvider::default();
        provider.owners.insert((conn.key().source(), conn.key().destination()), 10200);
        let cache = cache(Arc::new(provider), Duration::from_secs(60));

        cache.attribute(&conn).await;
        assert_eq!(cache.lookup_by_port(None, 51002).await.unwrap().uid, 10200);

        // 已关闭的连接不再记录
        let closed = connection(51003);
        closed.cancel();
        cache.attribute(&closed).await;
        assert!(cache.remote_address_by_port(51003).is_none());
    }

    /// 解析期间连接被关闭
    struct ClosingProvider {
        conn: Arc<Connection>,
    }

    impl OwnerProvider for ClosingProvider {
        fn name(&self) -> &'static str {
            "closing"
        }

        fn resolve_owner(&self, _local: SocketAddr, _remote: SocketAddr) -> Result<u32> {
            self.conn.cancel();
            Ok(10300)
        }

        fn process_info(&self, uid: u32) -> Result<ProcessInfo> {
            Err(Error::AttributionUnavailable(format!("uid {}", uid)))
        }
    }

    #[tokio::test]
    async fn test_close_during_attribution_leaves_no_entry() {
        let conn = connection(51004);
        let provider = Arc::new(ClosingProvider { conn: conn.clone() });
        let cache = AttributionCache::with_ttl(
            Duration::from_secs(60),
            Duration::from_secs(300),
            100,
            provider,
            None,
        );

        // 关闭路径先清理，随后解析结果才返回
        cache.remove_on_close(&conn);
        cache.attribute(&conn).await;
        assert!(conn.is_cancelled());
        assert!(cache.remote_address_by_port(51004).is_none());
    }

    #[tokio::test]
    async fn test_unavailable_provider_lookups_are_empty() {
        let cache = AttributionCache::with_ttl(
            Duration::from_secs(60),
            Duration::from_secs(300),
            100,
            Arc::new(UnavailableProvider),
            Some(proxy()),
        );
        assert!(cache.lookup_by_port(Some("127.0.0.1"), 50000).await.is_none());
        assert!(cache.remote_address_by_port(50000).is_none());
    }
}
