use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 包长度不足或头部无法解析，丢弃即可
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// 真实 socket 连接/读/写失败，连接异常终止（不发 FIN）
    #[error("Socket failure: {0}")]
    SocketFailure(std::io::Error),

    /// 真实 socket 正常读到流结束
    #[error("Stream complete")]
    StreamComplete,

    /// 无法解析连接所属进程
    #[error("Attribution unavailable: {0}")]
    AttributionUnavailable(String),

    /// 外部查询接口的参数错误
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
