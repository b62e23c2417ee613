//! TUN 模式模块
//!
//! ## 架构
//!
//! ```text
//! TUN Device -> TunRouter -> ConnectionHandler -> ConnectionTable
//!                   ^                                  |
//!                   |                                  v
//!               TunWriter <------------------------ IoService -> 真实 TCP/UDP socket
//! ```

mod bridge;
mod connection;
mod device;
mod handler;
pub mod packet;
mod router;
mod table;

pub use bridge::IoService;
pub use connection::{Connection, FlowKey, FlowState, Protocol, Route, Upstream};
pub use device::TunDevice;
pub use handler::ConnectionHandler;
pub use router::{TunRouter, TunWriter};
pub use table::{is_private_ip, ConnectionTable, TableStats, DEFAULT_PORTS};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::attribution::{self, AttributionCache};
use crate::config::Config;
use crate::error::Result;

/// 启动 TUN 模式
pub async fn run_tun(config: Config, serve_rpc: bool, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("Starting TUN mode...");
    tracing::info!("   Device: {}", config.tun.name);
    tracing::info!("   Address: {}/{}", config.tun.address, config.tun.netmask);
    tracing::info!("   MTU: {}", config.tun.mtu);
    match config.proxy.address {
        Some(proxy) => tracing::info!("   Proxy: {} (ports {:?})", proxy, DEFAULT_PORTS),
        None => tracing::info!("   Proxy: none, all flows direct"),
    }

    // 创建 TUN 设备
    let device = TunDevice::create(&config.tun)?;
    tracing::info!("TUN device {} is up", device.name());

    let cache = Arc::new(AttributionCache::new(
        &config.cache,
        attribution::select_provider(),
        config.proxy.address,
    ));

    // 启动缓存清理任务
    let sweeper = cache.clone();
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(30)) => sweeper.run_pending_tasks(),
            }
        }
    });

    // 创建路由器
    let router = TunRouter::new(device.into_inner(), &config, Some(cache.clone()));

    if serve_rpc {
        let table = router.table();
        tokio::spawn(async move {
            if let Err(e) = crate::rpc::run(cache, Some(table)).await {
                tracing::error!("RPC server error: {}", e);
            }
        });
    }

    // 运行路由器
    router.run(shutdown).await
}
