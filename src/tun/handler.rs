//! 客户端包分发
//!
//! 按流查找或创建连接，维护客户端方向的序列号并回 ACK，
//! 数据交给 `IoService` 转发到真实 socket。

use std::sync::Arc;

use super::bridge::IoService;
use super::connection::{Connection, FlowKey, Protocol};
use super::packet::{self, Ipv4Header, TcpHeader, TransportHeader, UdpHeader};
use super::router::TunWriter;
use super::table::ConnectionTable;
use crate::error::Result;

/// 客户端包处理器
pub struct ConnectionHandler {
    table: Arc<ConnectionTable>,
    io: Arc<IoService>,
    writer: TunWriter,
}

impl ConnectionHandler {
    pub fn new(io: Arc<IoService>, writer: TunWriter) -> Self {
        Self {
            table: io.table().clone(),
            io,
            writer,
        }
    }

    /// 处理从 TUN 读到的一个 IP 包
    pub async fn handle_packet(&self, bytes: &[u8]) -> Result<()> {
        let parsed = packet::parse_packet(bytes)?;

        match parsed.transport {
            TransportHeader::Tcp(tcp) => self.handle_tcp(parsed.ip, tcp, parsed.payload).await,
            TransportHeader::Udp(udp) => self.handle_udp(parsed.ip, udp, parsed.payload).await,
            TransportHeader::Other(protocol) => {
                tracing::trace!("Unsupported protocol: {}", protocol);
                Ok(())
            }
        }
    }

    async fn handle_tcp(&self, ip: Ipv4Header, tcp: TcpHeader, payload: &[u8]) -> Result<()> {
        let key = FlowKey::new(Protocol::Tcp, ip.source, tcp.source_port, ip.destination, tcp.destination_port);
        let flags = tcp.flags;

        tracing::trace!(
            "{} (SYN={}, ACK={}, FIN={}, RST={}, seq={}, ack={}, len={})",
            key,
            flags.syn,
            flags.ack,
            flags.fin,
            flags.rst,
            tcp.sequence_number,
            tcp.ack_number,
            payload.len()
        );

        // SYN 包 - 新连接
        if flags.syn && !flags.ack {
            return self.handle_syn(key, ip, tcp).await;
        }

        let Some(conn) = self.table.get(&key).await else {
            return self.handle_unknown(&key, &ip, &tcp, payload).await;
        };

        if flags.rst {
            tracing::debug!("Client reset {}", key);
            self.table.close(&conn).await;
            return Ok(());
        }

        let seq = tcp.sequence_number;
        let mut forward = false;
        {
            let mut guard = conn.state().await;
            let st = &mut *guard;
            let has_data = !payload.is_empty() || flags.fin;
            let in_order = seq == st.recv_sequence && !st.client_fin;
            // 待写缓存已满时不确认，由客户端重传
            let has_room = self.io.has_upstream_room(&conn, payload.len());

            st.update_tcp(ip, tcp);

            if has_data {
                if in_order && has_room {
                    st.recv_sequence = seq.wrapping_add(payload.len() as u32);
                    if flags.fin {
                        st.recv_sequence = st.recv_sequence.wrapping_add(1);
                        st.client_fin = true;
                    }
                    forward = true;
                } else if in_order {
                    tracing::trace!("Upstream buffer full for {}, withholding ACK of seq={}", key, seq);
                } else {
                    tracing::trace!("Out of order segment for {} (seq={}, expected={})", key, seq, st.recv_sequence);
                }

                // 乱序或重传时重复确认当前位置
                if let Some((ip, tcp)) = st.tcp_templates() {
                    let ack = packet::synthesize_ack(ip, tcp, st.recv_sequence, st.send_next, st.timestamp);
                    self.writer.write_packet(ack).await?;
                }
            }
        }

        if forward {
            self.io.add_client_data(payload, &conn);
            if flags.fin {
                tracing::debug!("Client closed {}", key);
                self.io.close_upstream_write(&conn);
            }
        } else if payload.is_empty() && !flags.fin {
            self.table.keep_alive(&conn).await;
        }

        Ok(())
    }

    /// 收到 SYN：分配初始序列号，回 SYN+ACK，启动真实 socket
    async fn handle_syn(&self, key: FlowKey, ip: Ipv4Header, tcp: TcpHeader) -> Result<()> {
        let (mut conn, mut created) = self.table.get_or_create(key).await;

        // 同一五元组上序列号不同的 SYN 是端口复用，旧连接作废
        if !created && conn.state().await.recv_sequence != tcp.sequence_number.wrapping_add(1) {
            tracing::debug!("New SYN reuses {}, replacing stale connection", key);
            self.table.close(&conn).await;
            (conn, created) = self.table.get_or_create(key).await;
        }

        {
            let mut guard = conn.state().await;
            let st = &mut *guard;

            if created {
                let isn: u32 = rand::random();
                st.recv_sequence = tcp.sequence_number.wrapping_add(1);
                st.send_next = isn.wrapping_add(1);
            } else {
                tracing::debug!("Retransmitted SYN for {}", key);
            }
            st.update_tcp(ip, tcp);

            // SYN 占一个序列号
            if let Some((ip, tcp)) = st.tcp_templates() {
                let isn = st.send_next.wrapping_sub(1);
                let syn_ack = packet::synthesize_syn_ack(ip, tcp, st.recv_sequence, isn, st.timestamp);
                self.writer.write_packet(syn_ack).await?;
            }
        }

        if created {
            tracing::debug!("Accepted {}", key);
            self.io.register_session(conn);
        }
        Ok(())
    }

    /// 没有对应连接的非 SYN 包
    async fn handle_unknown(&self, key: &FlowKey, ip: &Ipv4Header, tcp: &TcpHeader, payload: &[u8]) -> Result<()> {
        if tcp.flags.rst {
            return Ok(());
        }

        // 已关闭连接的 FIN：直接确认，让客户端正常结束
        if tcp.flags.fin {
            let ack = tcp.sequence_number.wrapping_add(payload.len() as u32).wrapping_add(1);
            let timestamp = tcp.timestamp().map(Into::into);
            let packet = packet::synthesize_ack(ip, tcp, ack, tcp.ack_number, timestamp);
            return self.writer.write_packet(packet).await;
        }

        if payload.is_empty() {
            tracing::trace!("Ignoring ACK for unknown {}", key);
            return Ok(());
        }

        tracing::debug!("No connection for {}, sending RST", key);
        self.writer.write_packet(packet::synthesize_rst(ip, tcp)).await
    }

    async fn handle_udp(&self, ip: Ipv4Header, udp: UdpHeader, payload: &[u8]) -> Result<()> {
        let key = FlowKey::new(Protocol::Udp, ip.source, udp.source_port, ip.destination, udp.destination_port);
        tracing::trace!("{} ({} bytes)", key, payload.len());

        let (conn, created) = self.table.get_or_create(key).await;
        conn.state().await.update_udp(ip, udp);

        if created {
            self.io.register_session(conn.clone());
        }
        self.io.add_client_data(payload, &conn);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn connection(&self, key: &FlowKey) -> Option<Arc<Connection>> {
        self.table.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoConfig;
    use crate::tun::packet::tests::client_tcp_packet;
    use crate::tun::packet::{parse_packet, TcpFlags, TcpTimestamp};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const CLIENT: (Ipv4Addr, u16) = (Ipv4Addr::new(10, 0, 0, 2), 40000);

    fn handler() -> (ConnectionHandler, mpsc::Receiver<Vec<u8>>) {
        handler_with(&IoConfig::default())
    }

    fn handler_with(config: &IoConfig) -> (ConnectionHandler, mpsc::Receiver<Vec<u8>>) {
        let (writer, rx) = TunWriter::channel(64);
        let table = Arc::new(ConnectionTable::new(None));
        let io = Arc::new(IoService::new(table, writer.clone(), config));
        (ConnectionHandler::new(io, writer), rx)
    }

    async fn next_tcp(rx: &mut mpsc::Receiver<Vec<u8>>) -> (TcpHeader, Vec<u8>) {
        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let parsed = parse_packet(&raw).unwrap();
        let TransportHeader::Tcp(tcp) = parsed.transport else { panic!("not tcp") };
        (tcp, parsed.payload.to_vec())
    }

    #[tokio::test]
    async fn test_syn_ack_handshake() {
        let (handler, mut rx) = handler();
        // 只监听不 accept，连接停留在就绪状态
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ts = TcpTimestamp { value: 4242, echo_reply: 0 };
        let syn = client_tcp_packet(
            CLIENT,
            (Ipv4Addr::new(127, 0, 0, 1), port),
            1000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            Some(ts),
            &[],
        );

        handler.handle_packet(&syn).await.unwrap();

        let (syn_ack, _) = next_tcp(&mut rx).await;
        assert!(syn_ack.flags.syn && syn_ack.flags.ack);
        assert_eq!(syn_ack.ack_number, 1001);
        assert_eq!(syn_ack.source_port, port);
        assert_eq!(syn_ack.destination_port, 40000);
        assert_eq!(syn_ack.timestamp().unwrap().echo_reply, 4242);

        // 重传的 SYN 得到相同的 SYN+ACK
        handler.handle_packet(&syn).await.unwrap();
        let (again, _) = next_tcp(&mut rx).await;
        assert_eq!(again.sequence_number, syn_ack.sequence_number);
        assert_eq!(handler.table.len().await, 1);
    }

    #[tokio::test]
    async fn test_syn_with_new_sequence_replaces_flow() {
        let (handler, mut rx) = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = (Ipv4Addr::new(127, 0, 0, 1), listener.local_addr().unwrap().port());
        let key = FlowKey::new(Protocol::Tcp, CLIENT.0, CLIENT.1, server.0, server.1);

        let syn = client_tcp_packet(CLIENT, server, 1000, 0, TcpFlags { syn: true, ..Default::default() }, None, &[]);
        handler.handle_packet(&syn).await.unwrap();
        let (first, _) = next_tcp(&mut rx).await;
        assert_eq!(first.ack_number, 1001);
        let old = handler.connection(&key).await.unwrap();

        let reuse = client_tcp_packet(CLIENT, server, 5000, 0, TcpFlags { syn: true, ..Default::default() }, None, &[]);
        handler.handle_packet(&reuse).await.unwrap();

        // 旧连接的 FIN 可能先到，只看 SYN+ACK
        let syn_ack = loop {
            let (tcp, _) = next_tcp(&mut rx).await;
            if tcp.flags.syn {
                break tcp;
            }
        };
        assert!(syn_ack.flags.ack);
        assert_eq!(syn_ack.ack_number, 5001);

        assert!(old.is_cancelled());
        let current = handler.connection(&key).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert_eq!(current.state().await.recv_sequence, 5001);
        assert_eq!(handler.table.len().await, 1);
    }

    #[tokio::test]
    async fn test_rst_closes_connection() {
        let (handler, mut rx) = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = (Ipv4Addr::new(127, 0, 0, 1), listener.local_addr().unwrap().port());
        let syn = client_tcp_packet(CLIENT, server, 1, 0, TcpFlags { syn: true, ..Default::default() }, None, &[]);
        handler.handle_packet(&syn).await.unwrap();
        let _ = next_tcp(&mut rx).await;

        let key = FlowKey::new(Protocol::Tcp, CLIENT.0, CLIENT.1, server.0, server.1);
        let conn = handler.connection(&key).await.unwrap();

        let rst = client_tcp_packet(CLIENT, server, 2, 0, TcpFlags::rst(), None, &[]);
        handler.handle_packet(&rst).await.unwrap();

        assert!(conn.is_cancelled());
        assert!(handler.connection(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_fin_is_acked() {
        let (handler, mut rx) = handler();
        let fin = client_tcp_packet(
            CLIENT,
            (Ipv4Addr::new(1, 1, 1, 1), 443),
            300,
            800,
            TcpFlags::fin_ack(),
            None,
            &[],
        );
        handler.handle_packet(&fin).await.unwrap();

        let (ack, _) = next_tcp(&mut rx).await;
        assert!(ack.flags.ack && !ack.flags.rst);
        assert_eq!(ack.ack_number, 301);
        assert_eq!(ack.sequence_number, 800);
        assert!(handler.table.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_upstream_buffer_withholds_ack() {
        let config = IoConfig {
            max_pending_upstream: 8,
            ..Default::default()
        };
        let (handler, mut rx) = handler_with(&config);
        let server = (Ipv4Addr::new(1, 1, 1, 1), 443);
        let key = FlowKey::new(Protocol::Tcp, CLIENT.0, CLIENT.1, server.0, server.1);

        // 没有会话任务，数据一直留在缓存里
        let (conn, _) = handler.table.get_or_create(key).await;
        {
            let mut st = conn.state().await;
            st.recv_sequence = 1001;
            st.send_next = 7001;
        }

        let first = client_tcp_packet(CLIENT, server, 1001, 7001, TcpFlags::psh_ack(), None, b"12345678");
        handler.handle_packet(&first).await.unwrap();
        let (ack, _) = next_tcp(&mut rx).await;
        assert_eq!(ack.ack_number, 1009);
        assert_eq!(conn.pending_upstream(), 8);

        let second = client_tcp_packet(CLIENT, server, 1009, 7001, TcpFlags::psh_ack(), None, b"abcd");
        handler.handle_packet(&second).await.unwrap();
        let (dup, _) = next_tcp(&mut rx).await;
        assert_eq!(dup.ack_number, 1009);
        assert_eq!(conn.pending_upstream(), 8);
        assert_eq!(conn.state().await.recv_sequence, 1009);

        // 会话写出后缓存释放，重传的段被接收
        conn.release_upstream(8);
        handler.handle_packet(&second).await.unwrap();
        let (ack, _) = next_tcp(&mut rx).await;
        assert_eq!(ack.ack_number, 1013);
        assert_eq!(conn.pending_upstream(), 4);
    }

    #[tokio::test]
    async fn test_malformed_packet_rejected() {
        let (handler, _rx) = handler();
        assert!(handler.handle_packet(&[0x45; 10]).await.is_err());
    }

    /// 完整流程：握手、就绪前的数据先写出、响应带 PSH、远端关闭后发 FIN
    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (handler, mut rx) = handler();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = listener.local_addr().unwrap() else { unreachable!() };
        let server = (*addr.ip(), addr.port());

        let syn = client_tcp_packet(CLIENT, server, 1000, 0, TcpFlags { syn: true, ..Default::default() }, None, &[]);
        handler.handle_packet(&syn).await.unwrap();
        let (syn_ack, _) = next_tcp(&mut rx).await;
        let server_isn = syn_ack.sequence_number;

        // 真实 socket 可能尚未就绪，数据先缓存
        let data = client_tcp_packet(
            CLIENT,
            server,
            1001,
            server_isn.wrapping_add(1),
            TcpFlags::psh_ack(),
            None,
            b"hello",
        );
        handler.handle_packet(&data).await.unwrap();
        let (ack, _) = next_tcp(&mut rx).await;
        assert_eq!(ack.ack_number, 1006);

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        socket.write_all(b"world").await.unwrap();
        let (reply, payload) = next_tcp(&mut rx).await;
        assert_eq!(payload, b"world");
        assert!(reply.flags.psh);
        assert_eq!(reply.sequence_number, server_isn.wrapping_add(1));
        assert_eq!(reply.ack_number, 1006);

        drop(socket);

        // 流结束：零长度段，然后 FIN
        let (empty, payload) = next_tcp(&mut rx).await;
        assert!(payload.is_empty());
        assert!(!empty.flags.fin);
        let (fin, _) = next_tcp(&mut rx).await;
        assert!(fin.flags.fin);
        assert_eq!(fin.sequence_number, server_isn.wrapping_add(6));
        assert!(handler.table.is_empty().await);
    }
}
