//! TUN 路由器
//!
//! 从 TUN 设备读 IP 包并按顺序交给 `ConnectionHandler`；
//! 响应包经 `TunWriter` 通道由单独的任务写回设备。

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bridge::IoService;
use super::handler::ConnectionHandler;
use super::table::ConnectionTable;
use crate::attribution::AttributionCache;
use crate::config::Config;
use crate::error::{Error, Result};

/// TUN 写入器（用于将响应包写回 TUN 设备）
#[derive(Clone)]
pub struct TunWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl TunWriter {
    /// 创建写入器和对应的接收端
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// 写入 IP 包到 TUN 设备
    pub async fn write_packet(&self, packet: Vec<u8>) -> Result<()> {
        self.tx.send(packet).await.map_err(|_| Error::ChannelClosed)
    }
}

/// TUN 路由器
pub struct TunRouter<D> {
    /// TUN 设备
    device: D,
    handler: ConnectionHandler,
    io: Arc<IoService>,
    writer_rx: mpsc::Receiver<Vec<u8>>,
}

impl<D> TunRouter<D>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(device: D, config: &Config, attribution: Option<Arc<AttributionCache>>) -> Self {
        let (writer, writer_rx) = TunWriter::channel(config.io.writer_queue);
        let table = Arc::new(ConnectionTable::new(config.proxy.address));

        let mut io = IoService::new(table, writer.clone(), &config.io);
        if let Some(cache) = attribution {
            io = io.with_attribution(cache);
        }
        let io = Arc::new(io);
        let handler = ConnectionHandler::new(io.clone(), writer);

        Self { device, handler, io, writer_rx }
    }

    pub fn table(&self) -> Arc<ConnectionTable> {
        self.io.table().clone()
    }

    /// 运行路由器，直到设备关闭或收到关闭信号
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("TUN router starting...");

        let Self { device, handler, io, mut writer_rx } = self;
        let (mut reader, mut writer) = tokio::io::split(device);

        // 写任务：响应包按入队顺序写回设备
        let write_task = tokio::spawn(async move {
            while let Some(packet) = writer_rx.recv().await {
                if let Err(e) = writer.write(&packet).await {
                    tracing::debug!("TUN write error: {}", e);
                }
            }
        });

        // 主循环：同一个流的包按到达顺序处理
        let mut buf = vec![0u8; 65535];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("TUN router shutting down");
                    break;
                }

                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::warn!("TUN device closed");
                            break;
                        }
                        Ok(n) => {
                            if let Err(e) = handler.handle_packet(&buf[..n]).await {
                                tracing::trace!("Dropping packet: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::error!("TUN read error: {}", e);
                            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        io.stop();
        let closed = io.table().close_all().await;
        tracing::info!("Closed {} connections", closed);
        write_task.abort();

        Ok(())
    }
}
