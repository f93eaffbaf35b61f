//! btleplug GATT 链路
//!
//! 流程:
//! 1. 在适配器缓存中按地址查找外设
//! 2. 连接并发现服务
//! 3. 读取协议版本
//! 4. 订阅传输特征的通知

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ble::session::FrameLink;
use crate::ble::{FILE_TRANSFER_SERVICE_UUID, TRANSFER_CHAR_UUID, VERSION_CHAR_UUID};
use crate::codec;
use crate::error::{Result, TransferError};

/// 外设不在适配器缓存中时，临时扫描的最长时间
const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// 获取第一个蓝牙适配器
pub async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| TransferError::Transport("No Bluetooth adapters found".to_string()))
}

pub struct BtleplugLink {
    peripheral: PlatformPeripheral,
    transfer_char: Characteristic,
    notifications: Mutex<NotificationStream>,
    mtu: usize,
}

impl BtleplugLink {
    pub async fn connect(adapter: &Adapter, address: &str, mtu: usize) -> Result<Self> {
        let peripheral = find_peripheral(adapter, address).await?;

        if !peripheral.is_connected().await? {
            info!("Connecting to {}", address);
            peripheral.connect().await?;
        }

        debug!("Discovering services on {}", address);
        peripheral.discover_services().await?;

        if let Ok(version_char) = find_characteristic(&peripheral, VERSION_CHAR_UUID) {
            match peripheral.read(&version_char).await {
                Ok(raw) => match codec::read_u32_le(&raw, 0) {
                    Ok(version) => info!("File transfer protocol version {}", version),
                    Err(e) => warn!("Malformed version characteristic: {}", e),
                },
                Err(e) => warn!("Failed to read protocol version: {}", e),
            }
        }

        let transfer_char = find_characteristic(&peripheral, TRANSFER_CHAR_UUID)?;
        peripheral.subscribe(&transfer_char).await?;
        let notifications = peripheral.notifications().await?;

        info!("File transfer link ready on {} (mtu {})", address, mtu);
        Ok(Self {
            peripheral,
            transfer_char,
            notifications: Mutex::new(notifications),
            mtu,
        })
    }
}

#[async_trait]
impl FrameLink for BtleplugLink {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        // 外设确认后才发送下一段
        self.peripheral
            .write(&self.transfer_char, frame, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut notifications = self.notifications.lock().await;
        while let Some(notification) = notifications.next().await {
            if notification.uuid == TRANSFER_CHAR_UUID {
                return Ok(notification.value);
            }
        }
        Err(TransferError::LinkLost(
            "notification stream ended".to_string(),
        ))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.peripheral.unsubscribe(&self.transfer_char).await {
            debug!("Unsubscribe failed during close: {}", e);
        }
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

async fn cached_peripheral(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<PlatformPeripheral>> {
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            if props.address.to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<PlatformPeripheral> {
    if let Some(peripheral) = cached_peripheral(adapter, address).await? {
        return Ok(peripheral);
    }

    debug!("{} not in adapter cache, scanning", address);
    adapter.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(DISCOVERY_WINDOW, async {
        loop {
            if let Some(peripheral) = cached_peripheral(adapter, address).await? {
                return Ok::<_, TransferError>(peripheral);
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        }
    })
    .await;
    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {}", e);
    }

    match found {
        Ok(result) => result,
        Err(_) => Err(TransferError::Ble(btleplug::Error::DeviceNotFound)),
    }
}

fn find_characteristic(peripheral: &PlatformPeripheral, uuid: Uuid) -> Result<Characteristic> {
    for service in peripheral.services() {
        if service.uuid == FILE_TRANSFER_SERVICE_UUID {
            for char in service.characteristics {
                if char.uuid == uuid {
                    return Ok(char);
                }
            }
        }
    }
    Err(TransferError::Transport(format!(
        "Characteristic not found: {uuid}"
    )))
}
