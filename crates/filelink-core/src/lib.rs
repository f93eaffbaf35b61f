//! Filelink Core Library
//!
//! 通过 BLE 或 WiFi 管理与开发板之间的文件传输会话。
//!
//! # 模块
//!
//! - **scanner**: 汇总多个发现源的外设列表
//! - **bond**: BLE 绑定状态订阅
//! - **connection**: 单连接管理器和文件操作
//! - **ble**: btleplug 发现源、GATT 链路和二进制协议会话
//! - **wifi**: mDNS 发现源
//! - **transfer**: 协议帧、传输接口和 HTTP 会话
//! - **codec** / **path**: 字节编解码和远端路径工具
//!
//! # 使用示例
//!
//! ```ignore
//! use filelink_core::{
//!     AppSettings, BleDiscovery, BondEventBus, BondStateTracker, FileTransferConnectionManager,
//!     PeripheralScanner, PlatformConnector, WifiDiscovery,
//! };
//!
//! let settings = AppSettings::load();
//!
//! // 1. 扫描外设
//! let scanner = PeripheralScanner::new(
//!     settings.scan.clone(),
//!     vec![
//!         Arc::new(BleDiscovery::new(settings.scan.name_filter.clone())),
//!         Arc::new(WifiDiscovery::new(settings.scan.mdns_service.clone())),
//!     ],
//! );
//! scanner.start().await;
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! scanner.stop().await;
//!
//! // 2. 连接第一个外设并列出根目录
//! let manager = FileTransferConnectionManager::new(
//!     settings.connection.clone(),
//!     Arc::new(PlatformConnector::new(settings.ble.clone())),
//!     BondStateTracker::new(Arc::new(BondEventBus::new())),
//! );
//! manager.connect(scanner.peripherals()[0].clone()).await?;
//! for entry in manager.list_directory("/").await? {
//!     println!("{}", entry.name);
//! }
//! ```

pub mod ble;
pub mod bond;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod path;
pub mod peripheral;
pub mod scanner;
pub mod transfer;
pub mod wifi;

// BLE re-exports
pub use ble::{
    BleDiscovery, BleFileSession, BtleplugLink, FILE_TRANSFER_SERVICE_UUID, FrameLink,
    TRANSFER_CHAR_UUID,
};

pub use bond::{BondEvent, BondEventBus, BondEventSource, BondState, BondStateTracker};
pub use config::AppSettings;
pub use connection::{ConnectionState, DisconnectCause, FileTransferConnectionManager};
pub use error::{DecodeError, Result, TransferError};
pub use logging::LogLevel;
pub use peripheral::{AnyPeripheral, BlePeripheral, Peripheral, TransportKind, WifiPeripheral};
pub use scanner::{DiscoveryEvent, DiscoverySource, PeripheralScanner, ScanState, ScanUpdate};

// Transfer re-exports
pub use transfer::{
    DirectoryEntry, FileStat, FileTransport, HttpFileSession, PlatformConnector,
    TransportConnector, WriteReceipt,
};

pub use wifi::WifiDiscovery;
