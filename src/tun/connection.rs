//! 虚拟连接
//!
//! 每个流（五元组）对应一个 `Connection`。序列号、确认号、时间戳回显和最近一次
//! 的客户端头部模板都放在 `FlowState` 里，由每连接一把异步锁保护；
//! 所有改动序列号并写回 TUN 的操作都在这把锁内完成。

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::packet::{Ipv4Header, TcpHeader, TimestampEcho, UdpHeader};

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// 流键，连接存活期间不变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self { protocol, src_ip, src_port, dst_ip, dst_port }
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.src_ip, self.src_port))
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.dst_ip, self.dst_port))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// 真实 socket 的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// 直连真实目的地址
    Direct(SocketAddr),
    /// 经上游代理
    Proxy(SocketAddr),
}

impl Route {
    pub fn target(&self) -> SocketAddr {
        match self {
            Route::Direct(addr) | Route::Proxy(addr) => *addr,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Route::Direct(_))
    }
}

/// 发往真实 socket 的客户端数据
#[derive(Debug)]
pub enum Upstream {
    Data(Vec<u8>),
    /// 客户端发来 FIN，关闭写方向
    Shutdown,
}

/// 连接的可变状态
#[derive(Debug, Default)]
pub struct FlowState {
    /// 下一个发给客户端的序列号
    pub send_next: u32,
    /// 已确认的客户端序列号
    pub recv_sequence: u32,
    /// TCP 时间戳回显
    pub timestamp: Option<TimestampEcho>,
    pub last_ip_header: Option<Ipv4Header>,
    pub last_tcp_header: Option<TcpHeader>,
    pub last_udp_header: Option<UdpHeader>,
    /// 最近一次读取是否为本轮发送的最后一段
    pub has_received_last_segment: bool,
    /// 客户端是否已发 FIN
    pub client_fin: bool,
}

impl FlowState {
    /// 记录客户端 TCP 头作为之后响应包的模板
    pub fn update_tcp(&mut self, ip: Ipv4Header, tcp: TcpHeader) {
        if let Some(ts) = tcp.timestamp() {
            self.timestamp = Some(ts.into());
        }
        self.last_ip_header = Some(ip);
        self.last_tcp_header = Some(tcp);
    }

    pub fn update_udp(&mut self, ip: Ipv4Header, udp: UdpHeader) {
        self.last_ip_header = Some(ip);
        self.last_udp_header = Some(udp);
    }

    /// 构造 TCP 响应所需的头模板
    pub fn tcp_templates(&self) -> Option<(&Ipv4Header, &TcpHeader)> {
        Some((self.last_ip_header.as_ref()?, self.last_tcp_header.as_ref()?))
    }

    pub fn udp_templates(&self) -> Option<(&Ipv4Header, &UdpHeader)> {
        Some((self.last_ip_header.as_ref()?, self.last_udp_header.as_ref()?))
    }
}

/// 一个虚拟连接
pub struct Connection {
    key: FlowKey,
    route: Route,
    state: Mutex<FlowState>,
    is_connected: AtomicBool,
    is_aborting: AtomicBool,
    /// 会话任务是否已启动
    registered: AtomicBool,
    /// 真实 socket 就绪前，数据留在通道里
    upstream_tx: mpsc::UnboundedSender<Upstream>,
    upstream_rx: Mutex<Option<mpsc::UnboundedReceiver<Upstream>>>,
    /// 已确认但尚未写入真实 socket 的字节数
    pending_upstream: AtomicUsize,
    cancel: CancellationToken,
    /// 真实 socket 的本地端口
    local_port: OnceLock<u16>,
}

impl Connection {
    pub fn new(key: FlowKey, route: Route) -> Self {
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        Self {
            key,
            route,
            state: Mutex::new(FlowState::default()),
            is_connected: AtomicBool::new(false),
            is_aborting: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            upstream_tx,
            upstream_rx: Mutex::new(Some(upstream_rx)),
            pending_upstream: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            local_port: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// 进入该连接的独占区
    pub async fn state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().await
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_aborting(&self) -> bool {
        self.is_aborting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_aborting(&self) {
        self.is_aborting.store(true, Ordering::SeqCst);
    }

    /// 标记会话已启动，只有第一次调用返回 true
    pub(crate) fn mark_registered(&self) -> bool {
        !self.registered.swap(true, Ordering::SeqCst)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port.get().copied()
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        let _ = self.local_port.set(port);
    }

    /// 把客户端数据交给会话任务；连接已关闭时返回 false
    pub(crate) fn send_upstream(&self, msg: Upstream) -> bool {
        let len = match &msg {
            Upstream::Data(data) => data.len(),
            Upstream::Shutdown => 0,
        };
        // 先计数再发送，会话任务的释放不会早于计数
        self.pending_upstream.fetch_add(len, Ordering::SeqCst);
        if self.upstream_tx.send(msg).is_err() {
            self.release_upstream(len);
            return false;
        }
        true
    }

    /// 通道中等待写出的字节数
    pub fn pending_upstream(&self) -> usize {
        self.pending_upstream.load(Ordering::SeqCst)
    }

    /// 会话任务取走一段数据后调用
    pub(crate) fn release_upstream(&self, len: usize) {
        let _ = self
            .pending_upstream
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(len)));
    }

    pub(crate) async fn take_upstream(&self) -> Option<mpsc::UnboundedReceiver<Upstream>> {
        self.upstream_rx.lock().await.take()
    }

    /// 取消真实 socket。已取消时返回 false
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("route", &self.route)
            .field("connected", &self.is_connected())
            .field("aborting", &self.is_aborting())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}
