pub mod link;
pub mod scanner;
pub mod session;

use uuid::Uuid;

pub use link::BtleplugLink;
pub use scanner::BleDiscovery;
pub use session::{BleFileSession, FrameLink};

/// 文件传输服务 (16-bit 0xFEBB)
pub const FILE_TRANSFER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_febb_0000_1000_8000_0080_5f9b_34fb);
/// 协议版本特征，读出 u32 小端
pub const VERSION_CHAR_UUID: Uuid = Uuid::from_u128(0xadaf_0100_4669_6c65_5472_616e_7366_6572);
/// 命令写入 + 响应通知特征
pub const TRANSFER_CHAR_UUID: Uuid = Uuid::from_u128(0xadaf_0200_4669_6c65_5472_616e_7366_6572);
