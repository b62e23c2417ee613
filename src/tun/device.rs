//! TUN 设备
//!
//! Linux 下通过 /dev/net/tun 创建（tun crate），设备本身实现
//! `AsyncRead + AsyncWrite`，交给 `TunRouter` 拆分读写。

use crate::config::TunSettings;
use crate::error::{Error, Result};

/// TUN 设备包装器
pub struct TunDevice {
    inner: tun::AsyncDevice,
    name: String,
}

impl TunDevice {
    /// 创建 TUN 设备
    pub fn create(settings: &TunSettings) -> Result<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .address(settings.address)
            .netmask(settings.netmask)
            .destination(settings.address)
            .mtu(settings.mtu)
            .up();

        // Linux 特定配置
        #[cfg(target_os = "linux")]
        {
            tun_config.platform_config(|p| {
                p.ensure_root_privileges(true);
            });
        }

        // 设置设备名称
        #[allow(deprecated)]
        if !settings.name.is_empty() {
            tun_config.tun_name(&settings.name);
        }

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to create TUN device: {}", e))))?;

        let name = settings.name.clone();
        tracing::info!("TUN device created: {}", name);

        Ok(Self { inner: device, name })
    }

    /// 获取设备名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 取出底层异步设备
    pub fn into_inner(self) -> tun::AsyncDevice {
        tracing::debug!("Handing off TUN device: {}", self.name);
        self.inner
    }
}
