//! mDNS 发现源
//!
//! mdns-sd 的接收端是同步通道，因此在阻塞线程里轮询，
//! 解析出的服务转换为 [`WifiPeripheral`] 推入扫描队列。

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};
use crate::peripheral::{Peripheral, WifiPeripheral};
use crate::scanner::{DiscoveryEvent, DiscoverySource};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

struct BrowseTask {
    daemon: ServiceDaemon,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct WifiDiscovery {
    service: String,
    task: Mutex<Option<BrowseTask>>,
}

impl WifiDiscovery {
    /// `service` 形如 `_circuitpython._tcp.local.`
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            task: Mutex::new(None),
        }
    }
}

fn mdns_error(e: mdns_sd::Error) -> TransferError {
    TransferError::Transport(format!("mDNS: {e}"))
}

/// 实例名：完整服务名去掉服务类型后缀
fn instance_name<'a>(fullname: &'a str, service: &str) -> &'a str {
    fullname
        .strip_suffix(service)
        .map(|s| s.trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .unwrap_or(fullname)
}

/// 优先使用 IPv4 地址
fn preferred_address<'a>(addresses: impl IntoIterator<Item = &'a IpAddr>) -> Option<IpAddr> {
    addresses.into_iter().copied().min_by_key(IpAddr::is_ipv6)
}

fn to_peripheral(info: &ServiceInfo, service: &str) -> Option<WifiPeripheral> {
    let address = preferred_address(info.get_addresses())?;
    let name = instance_name(info.get_fullname(), service).to_string();
    Some(WifiPeripheral::new(
        address.to_string(),
        info.get_port(),
        Some(name),
    ))
}

fn browse(
    receiver: &mdns_sd::Receiver<ServiceEvent>,
    service: &str,
    events: &mpsc::Sender<DiscoveryEvent>,
    cancel: &CancellationToken,
) {
    // fullname -> address，用于把移除事件映射回外设
    let mut resolved: HashMap<String, String> = HashMap::new();

    while !cancel.is_cancelled() {
        let event = match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(_) if receiver.is_disconnected() => {
                debug!("mDNS browse channel closed");
                break;
            }
            Err(_) => continue,
        };
        let outgoing = match event {
            ServiceEvent::ServiceResolved(info) => match to_peripheral(&info, service) {
                Some(peripheral) => {
                    trace!(
                        "Resolved {} at {}",
                        info.get_fullname(),
                        peripheral.base_url()
                    );
                    resolved.insert(
                        info.get_fullname().to_string(),
                        peripheral.address().to_string(),
                    );
                    DiscoveryEvent::Sighted(peripheral.into())
                }
                None => {
                    debug!("{} resolved without an address", info.get_fullname());
                    continue;
                }
            },
            ServiceEvent::ServiceRemoved(_, fullname) => match resolved.remove(&fullname) {
                Some(address) => DiscoveryEvent::Lost(address),
                None => continue,
            },
            other => {
                trace!("mDNS event: {:?}", other);
                continue;
            }
        };
        if events.blocking_send(outgoing).is_err() {
            debug!("Scanner queue closed, stopping mDNS browse");
            break;
        }
    }
}

#[async_trait]
impl DiscoverySource for WifiDiscovery {
    fn name(&self) -> &'static str {
        "mDNS"
    }

    async fn start(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;
        let receiver = daemon.browse(&self.service).map_err(mdns_error)?;
        info!("mDNS browse started for {}", self.service);

        let cancel = CancellationToken::new();
        let service = self.service.clone();
        let token = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            browse(&receiver, &service, &events, &token);
        });
        *task = Some(BrowseTask {
            daemon,
            cancel,
            handle,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(BrowseTask {
            daemon,
            cancel,
            handle,
        }) = self.task.lock().await.take()
        else {
            return Ok(());
        };
        cancel.cancel();
        if let Err(e) = daemon.stop_browse(&self.service) {
            debug!("stop_browse failed: {}", e);
        }
        if let Err(e) = handle.await {
            warn!("mDNS browse task ended abnormally: {}", e);
        }
        daemon.shutdown().map_err(mdns_error)?;
        info!("mDNS browse stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SERVICE: &str = "_circuitpython._tcp.local.";

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("cpy-f0f5bd._circuitpython._tcp.local.", SERVICE),
            "cpy-f0f5bd"
        );
        assert_eq!(instance_name("odd.name", SERVICE), "odd.name");
    }

    #[test]
    fn test_prefers_ipv4() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(preferred_address(&[v6, v4]), Some(v4));
        assert_eq!(preferred_address(&[v6]), Some(v6));
        assert_eq!(preferred_address(std::iter::empty()), None);
    }
}
