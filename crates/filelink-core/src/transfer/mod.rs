//! 文件传输模块
//!
//! 包含:
//! - BLE 二进制协议帧格式
//! - 与传输方式无关的 [`FileTransport`] 接口
//! - WiFi (HTTP) 会话实现
//! - 按外设类型分派的 [`PlatformConnector`]

pub mod http;
pub mod protocol;

pub use http::HttpFileSession;
pub use protocol::{Request, Response, ResponseDecoder};

use async_trait::async_trait;
use btleplug::platform::Adapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::ble::link::{BtleplugLink, first_adapter};
use crate::ble::session::BleFileSession;
use crate::config::BleConfig;
use crate::error::{Result, TransferError};
use crate::path;
use crate::peripheral::{AnyPeripheral, Peripheral};

/// 目录条目
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified_ns: Option<u64>,
}

/// 单个路径的元数据
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified_ns: Option<u64>,
}

/// 写入完成后外设回报的信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReceipt {
    pub bytes_written: u64,
    pub modified_ns: Option<u64>,
}

/// 一个已建立的文件传输会话
///
/// 路径在调用前已经规范化。
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<WriteReceipt>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn make_directory(&self, path: &str) -> Result<()>;

    async fn move_path(&self, from: &str, to: &str) -> Result<()>;

    /// 默认通过列出父目录查找条目
    async fn stat(&self, path: &str) -> Result<FileStat> {
        if path::is_root_directory(path) {
            return Ok(FileStat {
                path: path.to_string(),
                is_directory: true,
                size: 0,
                modified_ns: None,
            });
        }
        let trimmed = path.strip_suffix(path::SEPARATOR).unwrap_or(path);
        let parent = path::path_removing_filename(trimmed);
        let name = path::filename_from_path(trimmed);
        let entries = self.list_directory(parent).await?;
        entries
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| FileStat {
                path: trimmed.to_string(),
                is_directory: e.is_directory,
                size: e.size,
                modified_ns: e.modified_ns,
            })
            .ok_or(TransferError::Status {
                op: "stat",
                status: protocol::status::ERROR_NO_FILE,
            })
    }

    async fn close(&self) -> Result<()>;
}

/// 为外设建立传输会话
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, peripheral: &AnyPeripheral) -> Result<Arc<dyn FileTransport>>;
}

/// 使用系统蓝牙适配器和 HTTP 客户端的连接器
pub struct PlatformConnector {
    ble: BleConfig,
    http: reqwest::Client,
    adapter: OnceCell<Adapter>,
}

impl PlatformConnector {
    pub fn new(ble: BleConfig) -> Self {
        Self {
            ble,
            http: reqwest::Client::new(),
            adapter: OnceCell::new(),
        }
    }
}

#[async_trait]
impl TransportConnector for PlatformConnector {
    async fn open(&self, peripheral: &AnyPeripheral) -> Result<Arc<dyn FileTransport>> {
        match peripheral {
            AnyPeripheral::Ble(p) => {
                let adapter = self.adapter.get_or_try_init(first_adapter).await?;
                let link = BtleplugLink::connect(adapter, p.address(), self.ble.mtu).await?;
                Ok(Arc::new(BleFileSession::new(link, self.ble.read_chunk_size)))
            }
            AnyPeripheral::Wifi(p) => {
                let session = HttpFileSession::new(self.http.clone(), p.base_url());
                session.probe().await?;
                Ok(Arc::new(session))
            }
        }
    }
}
