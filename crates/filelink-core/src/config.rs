//! 应用配置和持久化
//!
//! 超时、重连策略、扫描参数等设置的存储和读取。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogLevel;

/// 重连退避策略
///
/// 第 n 次重试前等待 `min(initial_delay * 2^(n-1), max_delay)`，
/// 再加上不超过 `jitter_ms` 的随机抖动。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 100,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次（从 1 开始）尝试之前的等待时间，不含抖动
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// 连接管理器设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 建立传输会话的超时
    pub connect_timeout_ms: u64,
    /// 单个文件操作的超时
    pub operation_timeout_ms: u64,
    /// BLE 写操作前是否要求已绑定
    pub require_bond_for_writes: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 30_000,
            require_bond_for_writes: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// 扫描设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// 超过该时长未再次发现的外设会被移除
    pub peripheral_ttl_ms: u64,
    /// 过期检查周期
    pub prune_interval_ms: u64,
    /// 仅保留广播名包含该字符串的 BLE 外设
    pub name_filter: Option<String>,
    /// mDNS 服务类型
    pub mdns_service: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            peripheral_ttl_ms: 30_000,
            prune_interval_ms: 1_000,
            name_filter: None,
            mdns_service: "_circuitpython._tcp.local.".to_string(),
        }
    }
}

impl ScanConfig {
    pub fn peripheral_ttl(&self) -> Duration {
        Duration::from_millis(self.peripheral_ttl_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// BLE 链路设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// 单次 GATT 写入的最大字节数
    pub mtu: usize,
    /// 读文件时每次请求的块大小
    pub read_chunk_size: u32,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            mtu: 244,
            read_chunk_size: 4096,
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    /// 日志级别
    pub log_level: LogLevel,
    pub connection: ConnectionConfig,
    pub scan: ScanConfig,
    pub ble: BleConfig,
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filelink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
