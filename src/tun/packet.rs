//! IP 包解析与构造
//!
//! 解析从 TUN 读到的 IPv4 + TCP/UDP 头，并以这些头作为模板构造写回 TUN 的响应包
//! （源/目的互换，长度与校验和重新计算）。

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};

use crate::error::{Error, Result};

/// 协议号
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// 合成包不带 IP 选项时 UDP 负载的上限
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN - UDP_HEADER_LEN;

/// 我们通告给客户端的接收窗口
const DEFAULT_WINDOW: u16 = 65535;
/// SYN+ACK 中通告的 MSS
const DEFAULT_MSS: u16 = 1460;

/// TCP 选项
const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_TIMESTAMP: u8 = 8;
const OPT_TIMESTAMP_LEN: u8 = 10;

/// 进程内共享的 IP identification 计数器（回绕）
static PACKET_ID: AtomicU16 = AtomicU16::new(1);

fn next_packet_id() -> u16 {
    PACKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// TCP 时间戳选项使用的本地时钟（毫秒）
fn timestamp_clock() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    // 从 1 开始，避免发出 TSval = 0
    (epoch.elapsed().as_millis() as u32).wrapping_add(1)
}

/// IPv4 头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// 头长度（32 位字）
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    /// 3 位标志
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags & 0b010 != 0
    }
}

/// TCP 标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn ack() -> Self {
        Self { ack: true, ..Default::default() }
    }

    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }

    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }

    pub fn rst() -> Self {
        Self { rst: true, ..Default::default() }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }
}

/// TCP 时间戳选项 (TSval, TSecr)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTimestamp {
    pub value: u32,
    pub echo_reply: u32,
}

/// 连接上记录的时间戳回显字段
///
/// `sender` 是客户端最近一次的 TSval，`reply_to` 是客户端最近一次的 TSecr。
/// 响应包的 TSecr 回显 `sender`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampEcho {
    pub sender: u32,
    pub reply_to: u32,
}

impl From<TcpTimestamp> for TimestampEcho {
    fn from(ts: TcpTimestamp) -> Self {
        Self { sender: ts.value, reply_to: ts.echo_reply }
    }
}

/// TCP 头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub ack_number: u32,
    /// 头长度（32 位字）
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// 从选项中取出时间戳
    pub fn timestamp(&self) -> Option<TcpTimestamp> {
        let opts = &self.options;
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                OPT_END => break,
                OPT_NOP => i += 1,
                kind => {
                    let len = *opts.get(i + 1)? as usize;
                    if len < 2 || i + len > opts.len() {
                        return None;
                    }
                    if kind == OPT_TIMESTAMP && len == OPT_TIMESTAMP_LEN as usize {
                        let v = &opts[i + 2..i + 10];
                        return Some(TcpTimestamp {
                            value: u32::from_be_bytes([v[0], v[1], v[2], v[3]]),
                            echo_reply: u32::from_be_bytes([v[4], v[5], v[6], v[7]]),
                        });
                    }
                    i += len;
                }
            }
        }
        None
    }
}

/// UDP 头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// 传输层头
#[derive(Debug, Clone)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    /// 不处理的协议
    Other(u8),
}

/// 一个完整解析后的 IP 包
#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub ip: Ipv4Header,
    pub transport: TransportHeader,
    pub payload: &'a [u8],
}

/// 解析 IPv4 头
pub fn parse_ip_header(bytes: &[u8]) -> Result<Ipv4Header> {
    if bytes.len() < IPV4_MIN_HEADER_LEN {
        return Err(Error::MalformedPacket(format!(
            "IPv4 header needs {} bytes, got {}",
            IPV4_MIN_HEADER_LEN,
            bytes.len()
        )));
    }

    let slice = Ipv4HeaderSlice::from_slice(bytes)
        .map_err(|e| Error::MalformedPacket(format!("Invalid IPv4 header: {:?}", e)))?;
    let raw = slice.slice();

    Ok(Ipv4Header {
        ihl: slice.ihl(),
        tos: raw[1],
        total_length: slice.total_len(),
        identification: slice.identification(),
        flags: raw[6] >> 5,
        fragment_offset: u16::from_be_bytes([raw[6] & 0x1f, raw[7]]),
        ttl: slice.ttl(),
        protocol: raw[9],
        checksum: u16::from_be_bytes([raw[10], raw[11]]),
        source: slice.source_addr(),
        destination: slice.destination_addr(),
        options: raw[IPV4_MIN_HEADER_LEN..].to_vec(),
    })
}

/// 解析 TCP 头
pub fn parse_tcp_header(bytes: &[u8]) -> Result<TcpHeader> {
    if bytes.len() < TCP_MIN_HEADER_LEN {
        return Err(Error::MalformedPacket(format!(
            "TCP header needs {} bytes, got {}",
            TCP_MIN_HEADER_LEN,
            bytes.len()
        )));
    }

    let slice = TcpHeaderSlice::from_slice(bytes)
        .map_err(|e| Error::MalformedPacket(format!("Invalid TCP header: {:?}", e)))?;
    let raw = slice.slice();

    Ok(TcpHeader {
        source_port: slice.source_port(),
        destination_port: slice.destination_port(),
        sequence_number: slice.sequence_number(),
        ack_number: slice.acknowledgment_number(),
        data_offset: raw[12] >> 4,
        flags: TcpFlags::from_byte(raw[13]),
        window: slice.window_size(),
        checksum: u16::from_be_bytes([raw[16], raw[17]]),
        urgent_pointer: u16::from_be_bytes([raw[18], raw[19]]),
        options: raw[TCP_MIN_HEADER_LEN..].to_vec(),
    })
}

/// 解析 UDP 头（固定 8 字节，全部大端）
pub fn parse_udp_header(bytes: &[u8]) -> Result<UdpHeader> {
    let slice = UdpHeaderSlice::from_slice(bytes)
        .map_err(|e| Error::MalformedPacket(format!("Invalid UDP header: {:?}", e)))?;

    Ok(UdpHeader {
        source_port: slice.source_port(),
        destination_port: slice.destination_port(),
        length: slice.length(),
        checksum: slice.checksum(),
    })
}

/// 解析整个 IP 包，payload 以 IP total length 为界
pub fn parse_packet(bytes: &[u8]) -> Result<ParsedPacket<'_>> {
    let ip = parse_ip_header(bytes)?;

    let ip_hl = ip.header_len();
    let end = (ip.total_length as usize).min(bytes.len());
    if end < ip_hl {
        return Err(Error::MalformedPacket(format!(
            "IPv4 total length {} shorter than header {}",
            ip.total_length, ip_hl
        )));
    }
    let segment = &bytes[ip_hl..end];

    let (transport, payload) = match ip.protocol {
        PROTO_TCP => {
            let tcp = parse_tcp_header(segment)?;
            let hl = tcp.header_len();
            let payload = &segment[hl..];
            (TransportHeader::Tcp(tcp), payload)
        }
        PROTO_UDP => {
            let udp = parse_udp_header(segment)?;
            let udp_end = (udp.length as usize).clamp(UDP_HEADER_LEN, segment.len());
            (TransportHeader::Udp(udp), &segment[UDP_HEADER_LEN..udp_end])
        }
        other => (TransportHeader::Other(other), segment),
    };

    Ok(ParsedPacket { ip, transport, payload })
}

/// 构造 TCP 数据响应包
///
/// PSH 仅在 `is_push` 时设置；ACK 总是设置。
pub fn synthesize_tcp_response(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    payload: &[u8],
    is_push: bool,
    ack_number: u32,
    seq_number: u32,
    timestamp: Option<TimestampEcho>,
) -> Vec<u8> {
    let flags = if is_push { TcpFlags::psh_ack() } else { TcpFlags::ack() };
    build_tcp_response(ip, tcp, flags, seq_number, ack_number, timestamp, None, payload)
}

/// 构造 FIN 包，关闭面向客户端的一半连接
pub fn synthesize_fin(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    ack_number: u32,
    seq_number: u32,
    timestamp: Option<TimestampEcho>,
) -> Vec<u8> {
    build_tcp_response(ip, tcp, TcpFlags::fin_ack(), seq_number, ack_number, timestamp, None, &[])
}

/// 构造 SYN+ACK（带 MSS 选项）
pub fn synthesize_syn_ack(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    ack_number: u32,
    seq_number: u32,
    timestamp: Option<TimestampEcho>,
) -> Vec<u8> {
    build_tcp_response(
        ip,
        tcp,
        TcpFlags::syn_ack(),
        seq_number,
        ack_number,
        timestamp,
        Some(DEFAULT_MSS),
        &[],
    )
}

/// 构造纯 ACK
pub fn synthesize_ack(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    ack_number: u32,
    seq_number: u32,
    timestamp: Option<TimestampEcho>,
) -> Vec<u8> {
    build_tcp_response(ip, tcp, TcpFlags::ack(), seq_number, ack_number, timestamp, None, &[])
}

/// 构造 RST，序列号取客户端的确认号
pub fn synthesize_rst(ip: &Ipv4Header, tcp: &TcpHeader) -> Vec<u8> {
    let mut flags = TcpFlags::rst();
    let ack = if tcp.flags.ack {
        0
    } else {
        flags.ack = true;
        tcp.sequence_number.wrapping_add(1)
    };
    build_tcp_response(ip, tcp, flags, tcp.ack_number, ack, None, None, &[])
}

/// 构造 UDP 响应包（校验和置 0，IPv4 下表示不校验）
pub fn synthesize_udp_response(ip: &Ipv4Header, udp: &UdpHeader, payload: &[u8]) -> Vec<u8> {
    let payload = if payload.len() > MAX_UDP_PAYLOAD {
        tracing::warn!("UDP payload of {} bytes truncated to {}", payload.len(), MAX_UDP_PAYLOAD);
        &payload[..MAX_UDP_PAYLOAD]
    } else {
        payload
    };
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;

    let mut packet = Vec::with_capacity(total_len);
    write_ip_header(&mut packet, ip, total_len, PROTO_UDP);

    // ========== UDP Header (8 bytes) ==========
    packet.extend(&udp.destination_port.to_be_bytes());
    packet.extend(&udp.source_port.to_be_bytes());
    packet.extend(&(udp_len as u16).to_be_bytes());
    packet.extend(&[0x00, 0x00]);

    packet.extend(payload);
    packet
}

#[allow(clippy::too_many_arguments)]
fn build_tcp_response(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    timestamp: Option<TimestampEcho>,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let mut options = Vec::with_capacity(16);
    if let Some(mss) = mss {
        options.push(OPT_MSS);
        options.push(4);
        options.extend(&mss.to_be_bytes());
    }
    if let Some(echo) = timestamp {
        options.extend(&[OPT_NOP, OPT_NOP, OPT_TIMESTAMP, OPT_TIMESTAMP_LEN]);
        options.extend(&timestamp_clock().to_be_bytes());
        options.extend(&echo.sender.to_be_bytes());
    }
    debug_assert!(options.len() % 4 == 0);

    let tcp_hl = TCP_MIN_HEADER_LEN + options.len();
    let total_len = IPV4_MIN_HEADER_LEN + tcp_hl + payload.len();

    let mut packet = Vec::with_capacity(total_len);
    write_ip_header(&mut packet, ip, total_len, PROTO_TCP);

    // ========== TCP Header ==========
    let tcp_start = packet.len();
    packet.extend(&tcp.destination_port.to_be_bytes()); // Source Port
    packet.extend(&tcp.source_port.to_be_bytes());      // Destination Port
    packet.extend(&seq.to_be_bytes());                  // Sequence Number
    packet.extend(&ack.to_be_bytes());                  // Acknowledgment Number
    packet.push(((tcp_hl / 4) as u8) << 4);             // Data Offset + Reserved
    packet.push(flags.to_byte());                       // Flags
    packet.extend(&DEFAULT_WINDOW.to_be_bytes());       // Window Size
    packet.extend(&[0x00, 0x00]);                       // Checksum (placeholder)
    packet.extend(&[0x00, 0x00]);                       // Urgent Pointer
    packet.extend(&options);

    packet.extend(payload);

    // 目的地址变成源地址
    let tcp_checksum = transport_checksum(
        ip.destination,
        ip.source,
        PROTO_TCP,
        &packet[tcp_start..],
    );
    packet[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    packet
}

/// 以模板为基础写 IPv4 头：源/目的互换，强制 DF，新的 identification，
/// 重算总长度与校验和。客户端的 IP 选项不回显，头部固定 20 字节。
fn write_ip_header(packet: &mut Vec<u8>, template: &Ipv4Header, total_len: usize, protocol: u8) {
    let start = packet.len();
    let hl = IPV4_MIN_HEADER_LEN;
    debug_assert!(total_len <= u16::MAX as usize);

    packet.push(0x45);                                      // Version (4) + IHL (5)
    packet.push(template.tos);                              // DSCP + ECN
    packet.extend(&(total_len as u16).to_be_bytes());       // Total Length
    packet.extend(&next_packet_id().to_be_bytes());        // Identification
    packet.extend(&[0x40, 0x00]);                           // Flags (DF) + Fragment Offset
    packet.push(template.ttl);                              // TTL
    packet.push(protocol);                                  // Protocol
    packet.extend(&[0x00, 0x00]);                           // Header Checksum (placeholder)
    packet.extend(&template.destination.octets());          // Source IP
    packet.extend(&template.source.octets());               // Destination IP

    let ip_checksum = checksum(&packet[start..start + hl]);
    packet[start + 10..start + 12].copy_from_slice(&ip_checksum.to_be_bytes());
}

/// 16 位反码和
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    // 折叠进位
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// 计算 IP 头校验和
pub fn checksum(data: &[u8]) -> u16 {
    fold(ones_complement_sum(0, data))
}

/// 计算 TCP/UDP 校验和（包含伪头部）
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = ones_complement_sum(0, &src.octets());
    sum = ones_complement_sum(sum, &dst.octets());
    sum += u32::from(protocol);
    sum += segment.len() as u32;
    fold(ones_complement_sum(sum, segment))
}
