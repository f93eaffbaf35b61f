//! 错误类型
//!
//! 库内所有操作返回 [`TransferError`]；二进制入口统一转换为 `anyhow`。

use std::time::Duration;

/// 字节解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("read of {width} bytes at offset {offset} exceeds buffer length {len}")]
    OutOfRange {
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("unknown response opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("invalid utf-8 in path")]
    InvalidPath,
}

/// 文件传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Peripheral {address} must be bonded before writing")]
    BondRequired { address: String },

    #[error("Another connection is active ({address})")]
    ConnectionConflict { address: String },

    #[error("Peripheral rejected {op} with status 0x{status:02x}")]
    Status { op: &'static str, status: u8 },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransferError {
    /// 是否意味着底层链路已经断开
    ///
    /// 连接管理器据此决定是否转入 `Disconnected`。
    pub fn is_link_loss(&self) -> bool {
        match self {
            TransferError::LinkLost(_) => true,
            TransferError::Ble(e) => matches!(
                e,
                btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound
            ),
            TransferError::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_loss_classification() {
        assert!(TransferError::LinkLost("gone".into()).is_link_loss());
        assert!(TransferError::Ble(btleplug::Error::NotConnected).is_link_loss());
        assert!(!TransferError::NotConnected.is_link_loss());
        assert!(!TransferError::Timeout(Duration::from_secs(1)).is_link_loss());
        assert!(!TransferError::Status { op: "read", status: 5 }.is_link_loss());
    }

    #[test]
    fn test_display() {
        let err = TransferError::from(DecodeError::OutOfRange {
            offset: 3,
            width: 4,
            len: 5,
        });
        assert_eq!(
            err.to_string(),
            "Decode error: read of 4 bytes at offset 3 exceeds buffer length 5"
        );
    }
}
