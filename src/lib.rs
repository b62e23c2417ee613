//! tunflow - TUN 包转换引擎
//!
//! 从 TUN 设备读取 IPv4 TCP/UDP 包，为每个流建立真实 socket，
//! 再把真实 socket 上的数据合成为 IP 包写回 TUN；
//! 同时按本地端口记录连接所属进程，供外部查询。

pub mod attribution;
pub mod config;
pub mod error;
pub mod rpc;
pub mod tun;

pub use config::Config;
pub use error::{Error, Result};
