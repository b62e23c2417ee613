//! JSON-RPC 查询接口 (stdin/stdout)
//!
//! 每行一个请求，每行一个响应。方法：
//! - `getProcessByPort {host?, port}`
//! - `getRemoteAddressByPort {port}`
//! - `getStats`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::attribution::AttributionCache;
use crate::error::{Error, Result};
use crate::tun::ConnectionTable;

/// 参数缺失
pub const INVALID_ARGUMENT: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const PARSE_ERROR: i32 = -32700;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RpcResponse {
    Result { id: u64, result: Value },
    Error { id: u64, error: RpcError },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidArgument(message) => Self {
                code: INVALID_ARGUMENT,
                message: format!("INVALID_ARGUMENT: {}", message),
            },
            other => Self {
                code: INTERNAL_ERROR,
                message: other.to_string(),
            },
        }
    }
}

pub struct RpcServer {
    tx: mpsc::UnboundedSender<RpcResponse>,
    cache: Arc<AttributionCache>,
    table: Option<Arc<ConnectionTable>>,
}

/// 在 stdin/stdout 上提供查询接口，直到 stdin 关闭
pub async fn run(cache: Arc<AttributionCache>, table: Option<Arc<ConnectionTable>>) -> Result<()> {
    let (server, mut rx) = RpcServer::new(cache, table);
    let server = Arc::new(server);

    let stdout_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let Ok(mut json) = serde_json::to_string(&response) else {
                continue;
            };
            json.push('\n');
            if let Err(e) = stdout.write_all(json.as_bytes()).await {
                error!("Failed to write to stdout: {}", e);
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!("Failed to flush stdout: {}", e);
                break;
            }
        }
    });

    let stdin_task = tokio::spawn(async move { server.handle_stdin().await });

    tokio::select! {
        _ = stdout_task => {},
        _ = stdin_task => {},
    }

    Ok(())
}

impl RpcServer {
    pub fn new(
        cache: Arc<AttributionCache>,
        table: Option<Arc<ConnectionTable>>,
    ) -> (Self, mpsc::UnboundedReceiver<RpcResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, cache, table }, rx)
    }

    async fn handle_stdin(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("stdin closed");
                    break;
                }
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = self.handle_line(&line).await {
                        error!("Failed to handle request: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// 处理一行请求并把响应送往输出通道
    pub async fn handle_line(&self, line: &str) -> Result<()> {
        let response = match serde_json::from_str::<RpcRequest>(line.trim()) {
            Ok(request) => {
                debug!("Received RPC request: {:?}", request);
                self.dispatch(request).await
            }
            Err(e) => RpcResponse::Error {
                id: 0,
                error: RpcError {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {}", e),
                },
            },
        };

        self.tx.send(response)?;
        Ok(())
    }

    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.unwrap_or(0);

        let result = match request.method.as_str() {
            "getProcessByPort" => self.handle_process_by_port(&request.params).await,
            "getRemoteAddressByPort" => self.handle_remote_address_by_port(&request.params),
            "getStats" => self.handle_stats().await,
            _ => Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", request.method),
            }),
        };

        match result {
            Ok(result) => RpcResponse::Result { id, result },
            Err(error) => RpcResponse::Error { id, error },
        }
    }

    async fn handle_process_by_port(&self, params: &Value) -> std::result::Result<Value, RpcError> {
        let Some(port) = port_param(params)? else {
            return Ok(Value::Null);
        };
        let host = params.get("host").and_then(Value::as_str);

        match self.cache.lookup_by_port(host, port).await {
            Some(info) => Ok(serde_json::to_value(info).map_err(Error::from)?),
            None => Ok(Value::Null),
        }
    }

    fn handle_remote_address_by_port(&self, params: &Value) -> std::result::Result<Value, RpcError> {
        let Some(port) = port_param(params)? else {
            return Ok(Value::Null);
        };

        Ok(self
            .cache
            .remote_address_by_port(port)
            .map(|remote| serde_json::json!(remote))
            .unwrap_or(Value::Null))
    }

    async fn handle_stats(&self) -> std::result::Result<Value, RpcError> {
        let stats = match &self.table {
            Some(table) => table.stats().await,
            None => Default::default(),
        };
        Ok(serde_json::json!(stats))
    }
}

/// 取出 port 参数
///
/// 缺失时报参数错误；存在但不是合法端口时返回 None（查询结果为 null）。
fn port_param(params: &Value) -> Result<Option<u16>> {
    let value = match params.get("port") {
        None | Some(Value::Null) => return Err(Error::InvalidArgument("Port is null".into())),
        Some(value) => value,
    };

    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    Ok(port.filter(|p| *p != 0))
}
