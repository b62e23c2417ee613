//! 连接表 - 流追踪
//!
//! 五元组 -> 虚拟连接。同一个流的重复包拿到的永远是同一个 `Connection`，
//! 关闭时先从表中移除再取消真实 socket，两步在写锁内完成。

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::connection::{Connection, FlowKey, Protocol, Route};

/// 走上游代理的目的端口
pub const DEFAULT_PORTS: [u16; 6] = [80, 443, 8080, 8088, 8888, 9000];

/// 连接表
pub struct ConnectionTable {
    /// 连接
    entries: RwLock<HashMap<FlowKey, Arc<Connection>>>,
    /// 上游代理地址
    proxy_addr: Option<SocketAddr>,
}

impl ConnectionTable {
    pub fn new(proxy_addr: Option<SocketAddr>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            proxy_addr,
        }
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy_addr
    }

    /// 决定真实 socket 的去向
    ///
    /// 只有 TCP、目的地址为公网、端口属于 `DEFAULT_PORTS` 且配置了代理时才走代理。
    pub fn route_for(&self, key: &FlowKey) -> Route {
        match (key.protocol, self.proxy_addr) {
            (Protocol::Tcp, Some(proxy))
                if !is_private_ip(key.dst_ip) && DEFAULT_PORTS.contains(&key.dst_port) =>
            {
                Route::Proxy(proxy)
            }
            _ => Route::Direct(key.destination()),
        }
    }

    /// 查找连接
    pub async fn get(&self, key: &FlowKey) -> Option<Arc<Connection>> {
        self.entries.read().await.get(key).cloned()
    }

    /// 查找或创建连接，第二个返回值表示是否新建
    pub async fn get_or_create(&self, key: FlowKey) -> (Arc<Connection>, bool) {
        // 先尝试查找
        if let Some(conn) = self.get(&key).await {
            return (conn, false);
        }

        let mut entries = self.entries.write().await;
        // 拿写锁期间可能已被其他任务创建
        if let Some(conn) = entries.get(&key) {
            return (conn.clone(), false);
        }

        let route = self.route_for(&key);
        let conn = Arc::new(Connection::new(key, route));
        entries.insert(key, conn.clone());

        match route {
            Route::Direct(addr) => tracing::debug!("New connection {} (direct {})", key, addr),
            Route::Proxy(addr) => tracing::debug!("New connection {} (proxy {})", key, addr),
        }
        (conn, true)
    }

    /// 关闭连接：移除表项并取消真实 socket
    ///
    /// 重复关闭是无害的，返回值表示本次是否真正移除了表项。
    pub async fn close(&self, conn: &Arc<Connection>) -> bool {
        let mut entries = self.entries.write().await;
        let removed = Self::remove_locked(&mut entries, conn);

        if !conn.cancel() {
            tracing::debug!("Connection {} already cancelled", conn);
        }
        removed
    }

    /// 只移除表项，不动 socket
    pub async fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut entries = self.entries.write().await;
        Self::remove_locked(&mut entries, conn)
    }

    fn remove_locked(entries: &mut HashMap<FlowKey, Arc<Connection>>, conn: &Arc<Connection>) -> bool {
        match entries.get(conn.key()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                entries.remove(conn.key());
                true
            }
            _ => false,
        }
    }

    /// 保持连接在表中
    pub async fn keep_alive(&self, conn: &Arc<Connection>) {
        if conn.is_cancelled() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.entry(*conn.key()).or_insert_with(|| conn.clone());
    }

    /// 取消并清空所有连接
    pub async fn close_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        for (_, conn) in entries.drain() {
            conn.cancel();
        }
        count
    }

    /// 获取当前条目数
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 获取统计信息
    pub async fn stats(&self) -> TableStats {
        let entries = self.entries.read().await;

        let mut stats = TableStats {
            total: entries.len(),
            ..Default::default()
        };

        for conn in entries.values() {
            match conn.protocol() {
                Protocol::Tcp => stats.tcp_count += 1,
                Protocol::Udp => stats.udp_count += 1,
            }
            if conn.is_connected() {
                stats.connected += 1;
            }
            if !conn.route().is_direct() {
                stats.proxied += 1;
            }
        }

        stats
    }
}

/// 连接表统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub total: usize,
    pub tcp_count: usize,
    pub udp_count: usize,
    pub connected: usize,
    pub proxied: usize,
}

/// 10.0.0.0/8、172.16.0.0/12、192.168.0.0/16
pub fn is_private_ip(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}
