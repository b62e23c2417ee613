//! 连接所属进程的解析
//!
//! Linux 下从 /proc/net/{tcp,tcp6,udp,udp6} 的 uid 列得到 socket 的所有者，
//! 再从 /etc/passwd 得到账户信息。其他平台没有可用的来源。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ProcessInfo;
use crate::error::{Error, Result};

const PROC_NET_TCP: &str = "/proc/net/tcp";

/// 所属进程信息来源
pub trait OwnerProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// 按 (本地, 远端) 地址对查 socket 所有者 uid
    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Result<u32>;

    /// 按 uid 查进程（账户）信息
    fn process_info(&self, uid: u32) -> Result<ProcessInfo>;
}

/// 选择当前平台可用的来源
pub fn select_provider() -> Arc<dyn OwnerProvider> {
    if cfg!(target_os = "linux") && Path::new(PROC_NET_TCP).exists() {
        tracing::info!("Process attribution via /proc/net");
        return Arc::new(ProcNetProvider::new());
    }

    tracing::warn!("Process attribution unavailable on this platform");
    Arc::new(UnavailableProvider)
}

/// 不支持的平台：所有查询都返回不可用
#[derive(Debug, Default)]
pub struct UnavailableProvider;

impl OwnerProvider for UnavailableProvider {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Result<u32> {
        Err(Error::AttributionUnavailable(format!(
            "no owner source for {} -> {}",
            local, remote
        )))
    }

    fn process_info(&self, uid: u32) -> Result<ProcessInfo> {
        Err(Error::AttributionUnavailable(format!("no process source for uid {}", uid)))
    }
}

/// /proc/net 表中的一行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketEntry {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub uid: u32,
}

/// 基于 /proc/net 与 /etc/passwd 的来源
#[derive(Debug, Clone)]
pub struct ProcNetProvider {
    /// (路径, 是否 IPv6)
    tables: Vec<(PathBuf, bool)>,
    passwd: PathBuf,
}

impl ProcNetProvider {
    pub fn new() -> Self {
        Self {
            tables: vec![
                (PathBuf::from(PROC_NET_TCP), false),
                (PathBuf::from("/proc/net/tcp6"), true),
                (PathBuf::from("/proc/net/udp"), false),
                (PathBuf::from("/proc/net/udp6"), true),
            ],
            passwd: PathBuf::from("/etc/passwd"),
        }
    }

    fn read_entries(&self) -> Vec<SocketEntry> {
        let mut entries = Vec::new();
        for (path, is_v6) in &self.tables {
            // 表不存在（如未启用 IPv6）时跳过
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            entries.extend(parse_socket_table(&contents, *is_v6));
        }
        entries
    }
}

impl Default for ProcNetProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerProvider for ProcNetProvider {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn resolve_owner(&self, local: SocketAddr, remote: SocketAddr) -> Result<u32> {
        find_owner(&self.read_entries(), local, remote)
            .ok_or_else(|| Error::AttributionUnavailable(format!("no socket owns {} -> {}", local, remote)))
    }

    fn process_info(&self, uid: u32) -> Result<ProcessInfo> {
        let contents = std::fs::read_to_string(&self.passwd)?;
        parse_passwd(&contents, uid)
            .ok_or_else(|| Error::AttributionUnavailable(format!("unknown uid {}", uid)))
    }
}

/// 精确匹配 (本地, 远端)；否则本地端口唯一匹配到一个 uid 时取它
pub(crate) fn find_owner(entries: &[SocketEntry], local: SocketAddr, remote: SocketAddr) -> Option<u32> {
    let mut fallback = Vec::new();

    for entry in entries {
        if entry.local_port != local.port() || !ip_matches(entry.local_ip, local.ip()) {
            continue;
        }
        if entry.remote_port == remote.port() && ip_matches(entry.remote_ip, remote.ip()) {
            return Some(entry.uid);
        }
        if !fallback.contains(&entry.uid) {
            fallback.push(entry.uid);
        }
    }

    match fallback.as_slice() {
        [uid] => Some(*uid),
        _ => None,
    }
}

fn ip_matches(candidate: IpAddr, expected: IpAddr) -> bool {
    if candidate == expected || candidate.is_unspecified() || expected.is_unspecified() {
        return true;
    }

    match (candidate, expected) {
        (IpAddr::V6(v6), IpAddr::V4(v4)) | (IpAddr::V4(v4), IpAddr::V6(v6)) => {
            v6.to_ipv4_mapped().map(|mapped| mapped == v4).unwrap_or(false)
        }
        _ => false,
    }
}

pub(crate) fn parse_socket_table(contents: &str, is_v6: bool) -> Vec<SocketEntry> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| parse_socket_entry(line, is_v6))
        .collect()
}

fn parse_socket_entry(line: &str, is_v6: bool) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let (local_ip, local_port) = parse_endpoint(fields[1], is_v6)?;
    let (remote_ip, remote_port) = parse_endpoint(fields[2], is_v6)?;
    let uid = fields[7].parse::<u32>().ok()?;

    Some(SocketEntry {
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        uid,
    })
}

fn parse_endpoint(value: &str, is_v6: bool) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = value.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if is_v6 { parse_ipv6(addr_hex)? } else { parse_ipv4(addr_hex)? };
    Some((ip, port))
}

/// 内核按主机字节序（小端）输出
fn parse_ipv4(hex: &str) -> Option<IpAddr> {
    if hex.len() != 8 {
        return None;
    }
    let value = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(value.to_le_bytes())))
}

fn parse_ipv6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 {
        return None;
    }

    let mut octets = [0u8; 16];
    for (index, chunk) in octets.chunks_mut(4).enumerate() {
        let start = index * 8;
        let word = u32::from_str_radix(hex.get(start..start + 8)?, 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

/// 从 passwd 内容中取出 uid 对应的账户
pub(crate) fn parse_passwd(contents: &str, uid: u32) -> Option<ProcessInfo> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[2].parse::<u32>().ok()? != uid {
            return None;
        }

        let name = fields[0].to_string();
        let display_name = match fields[4].split(',').next() {
            Some(gecos) if !gecos.is_empty() => gecos.to_string(),
            _ => name.clone(),
        };

        Some(ProcessInfo {
            uid,
            name,
            display_name,
            path: Some(fields[5].to_string()).filter(|p| !p.is_empty()),
            remote_host: None,
            remote_port: None,
        })
    })
}
