//! Socket 桥接
//!
//! 每个连接一个会话任务：建立真实 socket，就绪后先写出缓存的客户端数据，
//! 再循环读取远端数据，合成 TCP/UDP 包写回 TUN。
//!
//! 会话结束分三种：
//! - 取消（本地关闭或远端 EOF）：移出连接表，TCP 向客户端发 FIN
//! - 失败（连接/读/写错误）：移出连接表，不发 FIN
//! - 服务停止：直接丢弃

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::connection::{Connection, Protocol, Upstream};
use super::packet;
use super::router::TunWriter;
use super::table::ConnectionTable;
use crate::attribution::AttributionCache;
use crate::config::IoConfig;
use crate::error::{Error, Result};

/// UDP 会话空闲超时
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 会话结束原因
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Failed(Error),
    Stopped,
}

impl From<io::Error> for SessionEnd {
    fn from(e: io::Error) -> Self {
        SessionEnd::Failed(Error::SocketFailure(e))
    }
}

/// 真实 socket 的 IO 服务
pub struct IoService {
    table: Arc<ConnectionTable>,
    writer: TunWriter,
    attribution: Option<Arc<AttributionCache>>,
    shutdown: AtomicBool,
    tcp_read_ceiling: usize,
    udp_read_ceiling: usize,
    max_pending_upstream: usize,
}

impl IoService {
    pub fn new(table: Arc<ConnectionTable>, writer: TunWriter, config: &IoConfig) -> Self {
        Self {
            table,
            writer,
            attribution: None,
            shutdown: AtomicBool::new(false),
            tcp_read_ceiling: config.tcp_read_ceiling.max(1),
            udp_read_ceiling: config.udp_read_ceiling.clamp(1, packet::MAX_UDP_PAYLOAD),
            max_pending_upstream: config.max_pending_upstream.max(1),
        }
    }

    /// 连接就绪后记录所属进程
    pub fn with_attribution(mut self, cache: Arc<AttributionCache>) -> Self {
        self.attribution = Some(cache);
        self
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    /// 为连接启动会话任务，同一个连接只会启动一次
    pub fn register_session(self: &Arc<Self>, conn: Arc<Connection>) {
        if self.is_stopped() {
            tracing::debug!("IO service stopped, not registering {}", conn);
            return;
        }
        if !conn.mark_registered() {
            return;
        }

        let service = self.clone();
        tokio::spawn(async move {
            service.run_session(conn).await;
        });
    }

    /// 连接的待写缓存能否再接收 `len` 字节；缓存为空时总是可以
    pub fn has_upstream_room(&self, conn: &Connection, len: usize) -> bool {
        let pending = conn.pending_upstream();
        pending == 0 || pending + len <= self.max_pending_upstream
    }

    /// 客户端数据交给真实 socket；未就绪时先缓存
    ///
    /// TCP 由调用方在确认前检查 `has_upstream_room`；UDP 超出上限时直接丢弃。
    pub fn add_client_data(&self, data: &[u8], conn: &Connection) {
        if data.is_empty() {
            return;
        }
        if conn.protocol() == Protocol::Udp && !self.has_upstream_room(conn, data.len()) {
            tracing::debug!("Upstream buffer full, dropping {} byte datagram for {}", data.len(), conn);
            return;
        }
        if !conn.send_upstream(Upstream::Data(data.to_vec())) {
            tracing::debug!("Dropping {} bytes for closed connection {}", data.len(), conn);
        }
    }

    /// 客户端已发 FIN，关闭真实 socket 的写方向
    pub fn close_upstream_write(&self, conn: &Connection) {
        conn.send_upstream(Upstream::Shutdown);
    }

    /// 停止服务：不再读取，正在进行的读取结束后直接丢弃
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!("IO service stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn run_session(self: Arc<Self>, conn: Arc<Connection>) {
        let Some(rx) = conn.take_upstream().await else {
            return;
        };

        let end = match conn.protocol() {
            Protocol::Tcp => self.run_tcp(&conn, rx).await,
            Protocol::Udp => self.run_udp(&conn, rx).await,
        };

        match end {
            SessionEnd::Cancelled => self.on_cancelled(&conn).await,
            SessionEnd::Failed(e) => self.on_failed(&conn, e).await,
            SessionEnd::Stopped => {
                conn.set_connected(false);
                self.table.close(&conn).await;
                self.forget_owner(&conn);
            }
        }
    }

    async fn run_tcp(&self, conn: &Arc<Connection>, mut rx: mpsc::UnboundedReceiver<Upstream>) -> SessionEnd {
        let token = conn.cancellation();
        let target = conn.route().target();

        let stream = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            result = TcpStream::connect(target) => match result {
                Ok(stream) => stream,
                Err(e) => return e.into(),
            },
        };
        let _ = stream.set_nodelay(true);
        self.on_ready(conn, stream.local_addr().ok().map(|a| a.port()));

        let (mut reader, mut writer) = stream.into_split();
        let mut write_open = true;

        // 就绪前缓存的数据先写出
        while let Ok(msg) = rx.try_recv() {
            if let Err(e) = forward_tcp(&mut writer, conn, msg, &mut write_open).await {
                conn.set_aborting();
                return e.into();
            }
        }

        let mut buf = vec![0u8; self.tcp_read_ceiling];
        let mut rx_open = true;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return SessionEnd::Cancelled,

                msg = rx.recv(), if rx_open => match msg {
                    Some(msg) => {
                        if let Err(e) = forward_tcp(&mut writer, conn, msg, &mut write_open).await {
                            conn.set_aborting();
                            return e.into();
                        }
                    }
                    None => rx_open = false,
                },

                result = reader.read(&mut buf) => match result {
                    Ok(n) => {
                        if self.is_stopped() {
                            return SessionEnd::Stopped;
                        }
                        if let Err(e) = self.push_data_to_client(conn, &buf[..n]).await {
                            tracing::debug!("Push to client failed for {}: {}", conn, e);
                            return SessionEnd::Stopped;
                        }
                        if n == 0 {
                            // 流结束：关闭后由取消分支发 FIN
                            tracing::debug!("{}: {}", Error::StreamComplete, conn);
                            conn.set_aborting();
                            self.table.close(conn).await;
                        }
                    }
                    Err(e) => {
                        conn.set_aborting();
                        return e.into();
                    }
                },
            }
        }
    }

    async fn run_udp(&self, conn: &Arc<Connection>, mut rx: mpsc::UnboundedReceiver<Upstream>) -> SessionEnd {
        let token = conn.cancellation();
        let target = conn.route().target();

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => return e.into(),
        };
        tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            result = socket.connect(target) => {
                if let Err(e) = result {
                    return e.into();
                }
            }
        }
        self.on_ready(conn, socket.local_addr().ok().map(|a| a.port()));

        while let Ok(msg) = rx.try_recv() {
            if let Upstream::Data(data) = msg {
                let result = socket.send(&data).await;
                conn.release_upstream(data.len());
                if let Err(e) = result {
                    return e.into();
                }
            }
        }

        let mut buf = vec![0u8; self.udp_read_ceiling];
        let idle = tokio::time::sleep(UDP_IDLE_TIMEOUT);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return SessionEnd::Cancelled,

                Some(msg) = rx.recv() => {
                    if let Upstream::Data(data) = msg {
                        let result = socket.send(&data).await;
                        conn.release_upstream(data.len());
                        if let Err(e) = result {
                            return e.into();
                        }
                        idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                    }
                }

                result = socket.recv(&mut buf) => match result {
                    Ok(0) => {
                        tracing::trace!("Ignoring empty datagram for {}", conn);
                    }
                    Ok(n) => {
                        if self.is_stopped() {
                            return SessionEnd::Stopped;
                        }
                        if let Err(e) = self.push_data_to_client(conn, &buf[..n]).await {
                            tracing::debug!("Push to client failed for {}: {}", conn, e);
                            return SessionEnd::Stopped;
                        }
                        idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                    }
                    Err(e) => return e.into(),
                },

                _ = &mut idle => {
                    tracing::debug!("UDP session idle, closing {}", conn);
                    self.table.close(conn).await;
                }
            }
        }
    }

    /// 把远端数据合成为响应包写回 TUN
    ///
    /// TCP 在连接的独占区内分配序列号并写出，保证同一连接的包按序列号顺序进入 TUN。
    /// 读取长度小于上限时视为本轮最后一段，设置 PSH。
    pub async fn push_data_to_client(&self, conn: &Connection, data: &[u8]) -> Result<()> {
        match conn.protocol() {
            Protocol::Tcp => {
                let mut guard = conn.state().await;
                let st = &mut *guard;

                let is_push = data.len() < self.tcp_read_ceiling;
                let seq = st.send_next;
                let Some((ip, tcp)) = st.tcp_templates() else {
                    tracing::warn!("No TCP template for {}, dropping {} bytes", conn, data.len());
                    return Ok(());
                };
                let packet =
                    packet::synthesize_tcp_response(ip, tcp, data, is_push, st.recv_sequence, seq, st.timestamp);

                st.send_next = seq.wrapping_add(data.len() as u32);
                st.has_received_last_segment = is_push;

                self.writer.write_packet(packet).await
            }
            Protocol::Udp => {
                let guard = conn.state().await;
                let Some((ip, udp)) = guard.udp_templates() else {
                    tracing::warn!("No UDP template for {}, dropping {} bytes", conn, data.len());
                    return Ok(());
                };
                let packet = packet::synthesize_udp_response(ip, udp, data);

                self.writer.write_packet(packet).await
            }
        }
    }

    /// 向客户端发 FIN
    async fn send_fin(&self, conn: &Connection) -> Result<()> {
        let mut guard = conn.state().await;
        let st = &mut *guard;

        let Some((ip, tcp)) = st.tcp_templates() else {
            return Ok(());
        };
        let packet = packet::synthesize_fin(ip, tcp, st.recv_sequence, st.send_next, st.timestamp);
        st.send_next = st.send_next.wrapping_add(1);

        self.writer.write_packet(packet).await
    }

    fn on_ready(&self, conn: &Arc<Connection>, local_port: Option<u16>) {
        if let Some(port) = local_port {
            conn.set_local_port(port);
        }
        conn.set_connected(true);
        tracing::debug!("Connected {} via {:?}", conn, conn.route());

        if let Some(cache) = &self.attribution {
            let cache = cache.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                cache.attribute(&conn).await;
            });
        }
    }

    async fn on_cancelled(&self, conn: &Arc<Connection>) {
        conn.set_connected(false);
        self.table.remove(conn).await;
        self.forget_owner(conn);

        if conn.protocol() == Protocol::Tcp {
            if let Err(e) = self.send_fin(conn).await {
                tracing::debug!("Failed to send FIN for {}: {}", conn, e);
            }
        }
        tracing::debug!("Connection {} closed", conn);
    }

    async fn on_failed(&self, conn: &Arc<Connection>, err: Error) {
        tracing::warn!("Connection {} failed: {}", conn, err);
        conn.set_connected(false);
        conn.set_aborting();
        self.table.close(conn).await;
        self.forget_owner(conn);
    }

    fn forget_owner(&self, conn: &Connection) {
        if let Some(cache) = &self.attribution {
            cache.remove_on_close(conn);
        }
    }
}

/// 写一条客户端消息到真实 socket
async fn forward_tcp(
    writer: &mut OwnedWriteHalf,
    conn: &Connection,
    msg: Upstream,
    write_open: &mut bool,
) -> io::Result<()> {
    match msg {
        Upstream::Data(data) if *write_open => {
            let result = writer.write_all(&data).await;
            conn.release_upstream(data.len());
            result
        }
        Upstream::Data(data) => {
            tracing::trace!("Write side closed, dropping {} bytes", data.len());
            conn.release_upstream(data.len());
            Ok(())
        }
        Upstream::Shutdown => {
            *write_open = false;
            writer.shutdown().await
        }
    }
}
