//! BLE 发现源
//!
//! 监听 btleplug 的中心事件，把每次广播（首次发现或更新）转换为
//! [`DiscoveryEvent::Sighted`]。外设的消失由扫描器的过期检查处理。

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ble::link::first_adapter;
use crate::error::Result;
use crate::peripheral::BlePeripheral;
use crate::scanner::{DiscoveryEvent, DiscoverySource};

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BleDiscovery {
    name_filter: Option<String>,
    adapter: OnceCell<Adapter>,
    task: Mutex<Option<ScanTask>>,
}

impl BleDiscovery {
    /// `name_filter` 为大小写不敏感的子串匹配
    pub fn new(name_filter: Option<String>) -> Self {
        Self {
            name_filter: name_filter.map(|f| f.to_lowercase()),
            adapter: OnceCell::new(),
            task: Mutex::new(None),
        }
    }
}

fn matches_filter(filter: Option<&str>, name: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(filter) => name.is_some_and(|n| n.to_lowercase().contains(filter)),
    }
}

async fn sighting(
    adapter: &Adapter,
    id: &PeripheralId,
    filter: Option<&str>,
) -> Result<Option<BlePeripheral>> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };
    if !matches_filter(filter, props.local_name.as_deref()) {
        trace!("Skipping {} ({:?})", props.address, props.local_name);
        return Ok(None);
    }
    Ok(Some(BlePeripheral::new(
        props.address.to_string(),
        props.local_name,
        props.rssi,
    )))
}

async fn run(
    adapter: Adapter,
    filter: Option<String>,
    events: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut central = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(DiscoveryEvent::Error(e.to_string())).await;
            return;
        }
    };

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = central.next() => event,
        };
        let id = match event {
            Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => id,
            Some(_) => continue,
            None => {
                warn!("BLE event stream ended");
                let _ = events
                    .send(DiscoveryEvent::Error("BLE event stream ended".to_string()))
                    .await;
                break;
            }
        };
        let forwarded = match sighting(&adapter, &id, filter.as_deref()).await {
            Ok(Some(p)) => events.send(DiscoveryEvent::Sighted(p.into())).await,
            Ok(None) => Ok(()),
            Err(e) => events.send(DiscoveryEvent::Error(e.to_string())).await,
        };
        if forwarded.is_err() {
            debug!("Scanner queue closed, stopping BLE discovery");
            break;
        }
    }
}

#[async_trait]
impl DiscoverySource for BleDiscovery {
    fn name(&self) -> &'static str {
        "BLE"
    }

    async fn start(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let adapter = self.adapter.get_or_try_init(first_adapter).await?.clone();
        adapter.start_scan(ScanFilter::default()).await?;
        info!("BLE scan started (filter: {:?})", self.name_filter);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            adapter,
            self.name_filter.clone(),
            events,
            cancel.clone(),
        ));
        *task = Some(ScanTask { cancel, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(ScanTask { cancel, handle }) = self.task.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!("BLE discovery task ended abnormally: {}", e);
        }
        if let Some(adapter) = self.adapter.get() {
            adapter.stop_scan().await?;
        }
        info!("BLE scan stopped");
        Ok(())
    }
}
