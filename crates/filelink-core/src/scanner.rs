//! 外设扫描器
//!
//! 多个发现源（BLE、mDNS）把事件推入同一个有序队列，
//! 由唯一的消费任务修改外设列表，避免交错的部分更新。
//!
//! 对外提供三个读取面:
//! - [`PeripheralScanner::peripherals`]：当前列表快照
//! - [`PeripheralScanner::subscribe`]：增量更新流（不回放历史）
//! - [`PeripheralScanner::last_error`]：独立的错误槽，不影响列表

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::peripheral::{AnyPeripheral, Peripheral, now_millis};

const EVENT_QUEUE: usize = 256;
const UPDATE_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Stopped,
    Running,
}

/// 发现源推送的事件
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Sighted(AnyPeripheral),
    /// 发现源明确报告外设已离开
    Lost(String),
    /// 无线电不可用、权限被撤销等
    Error(String),
}

/// 列表的增量变化
#[derive(Debug, Clone, PartialEq)]
pub enum ScanUpdate {
    Added(AnyPeripheral),
    Updated(AnyPeripheral),
    Removed(AnyPeripheral),
}

/// 一种发现外设的方式
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// 开始发现，事件写入 `events`
    async fn start(&self, events: mpsc::Sender<DiscoveryEvent>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// 由消费任务独占修改的外设列表
struct LiveList {
    peripherals: Arc<watch::Sender<Vec<AnyPeripheral>>>,
    updates: broadcast::Sender<ScanUpdate>,
    error: Arc<watch::Sender<Option<String>>>,
}

impl LiveList {
    fn publish(&self, update: ScanUpdate) {
        // 没有订阅者时发送失败，忽略
        let _ = self.updates.send(update);
    }

    fn apply(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Sighted(sighting) => {
                let mut update = None;
                self.peripherals.send_modify(|list| {
                    match list.iter_mut().find(|p| p.address() == sighting.address()) {
                        Some(existing) => {
                            existing.absorb(&sighting);
                            update = Some(ScanUpdate::Updated(existing.clone()));
                        }
                        None => {
                            debug!(
                                "Discovered {} over {}",
                                sighting.name_or_address(),
                                sighting.transport()
                            );
                            list.push(sighting.clone());
                            update = Some(ScanUpdate::Added(sighting));
                        }
                    }
                });
                if let Some(update) = update {
                    self.publish(update);
                }
            }
            DiscoveryEvent::Lost(address) => self.remove_where(|p| p.address() == address),
            DiscoveryEvent::Error(message) => {
                warn!("Discovery error: {}", message);
                self.error.send_replace(Some(message));
            }
        }
    }

    fn prune(&self, ttl: Duration) {
        let now = now_millis();
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.remove_where(|p| now.saturating_sub(p.last_seen_millis()) > ttl);
    }

    fn remove_where(&self, predicate: impl Fn(&AnyPeripheral) -> bool) {
        let mut removed = Vec::new();
        self.peripherals.send_if_modified(|list| {
            let before = list.len();
            list.retain(|p| {
                if predicate(p) {
                    removed.push(p.clone());
                    false
                } else {
                    true
                }
            });
            list.len() != before
        });
        for peripheral in removed {
            debug!("{} is no longer reachable", peripheral.name_or_address());
            self.publish(ScanUpdate::Removed(peripheral));
        }
    }
}

async fn consume(
    list: LiveList,
    mut events: mpsc::Receiver<DiscoveryEvent>,
    ttl: Duration,
    prune_interval: Duration,
    cancel: CancellationToken,
) {
    let mut prune = tokio::time::interval(prune_interval.max(Duration::from_millis(1)));
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => list.apply(event),
                None => break,
            },
            _ = prune.tick() => list.prune(ttl),
        }
    }
    debug!("Discovery consumer stopped");
}

struct Running {
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
    /// 保持队列打开，发现源全部退出后过期检查仍继续
    _events: mpsc::Sender<DiscoveryEvent>,
}

pub struct PeripheralScanner {
    config: ScanConfig,
    sources: Vec<Arc<dyn DiscoverySource>>,
    running: Mutex<Option<Running>>,
    state: watch::Sender<ScanState>,
    peripherals: Arc<watch::Sender<Vec<AnyPeripheral>>>,
    updates: broadcast::Sender<ScanUpdate>,
    error: Arc<watch::Sender<Option<String>>>,
}

impl PeripheralScanner {
    pub fn new(config: ScanConfig, sources: Vec<Arc<dyn DiscoverySource>>) -> Self {
        let (state, _) = watch::channel(ScanState::Stopped);
        let (peripherals, _) = watch::channel(Vec::new());
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (error, _) = watch::channel(None);
        Self {
            config,
            sources,
            running: Mutex::new(None),
            state,
            peripherals: Arc::new(peripherals),
            updates,
            error: Arc::new(error),
        }
    }

    /// 开始扫描，已在运行时不做任何事
    ///
    /// 发现源启动失败只写入错误槽，其余发现源照常运行。
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Scanner already running");
            return;
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let list = LiveList {
            peripherals: self.peripherals.clone(),
            updates: self.updates.clone(),
            error: self.error.clone(),
        };
        let consumer = tokio::spawn(consume(
            list,
            rx,
            self.config.peripheral_ttl(),
            self.config.prune_interval(),
            cancel.clone(),
        ));

        for source in &self.sources {
            match source.start(tx.clone()).await {
                Ok(()) => info!("Started {} discovery", source.name()),
                Err(e) => {
                    warn!("Failed to start {} discovery: {}", source.name(), e);
                    self.error
                        .send_replace(Some(format!("{} discovery: {e}", source.name())));
                }
            }
        }

        *running = Some(Running {
            cancel,
            consumer,
            _events: tx,
        });
        self.state.send_replace(ScanState::Running);
    }

    /// 停止扫描，保留已发现的外设
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            cancel, consumer, ..
        }) = running.take()
        else {
            return;
        };
        for source in &self.sources {
            if let Err(e) = source.stop().await {
                warn!("Failed to stop {} discovery: {}", source.name(), e);
            }
        }
        cancel.cancel();
        if let Err(e) = consumer.await {
            warn!("Discovery consumer ended abnormally: {}", e);
        }
        self.state.send_replace(ScanState::Stopped);
        info!(
            "Scan stopped with {} peripheral(s) known",
            self.peripherals.borrow().len()
        );
    }

    /// 清空外设列表和错误槽，每个被清除的外设都推送一条 `Removed`
    pub fn reset(&self) {
        let cleared = self.peripherals.send_replace(Vec::new());
        debug!("Reset cleared {} peripheral(s)", cleared.len());
        for peripheral in cleared {
            // 没有订阅者时发送失败，忽略
            let _ = self.updates.send(ScanUpdate::Removed(peripheral));
        }
        self.error.send_replace(None);
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    pub fn peripherals(&self) -> Vec<AnyPeripheral> {
        self.peripherals.borrow().clone()
    }

    pub fn watch_peripherals(&self) -> watch::Receiver<Vec<AnyPeripheral>> {
        self.peripherals.subscribe()
    }

    /// 订阅之后发生的变化
    pub fn subscribe(&self) -> impl Stream<Item = ScanUpdate> + Send + 'static {
        BroadcastStream::new(self.updates.subscribe()).filter_map(|update| async move {
            match update {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!("Scan subscriber lagging: {}", e);
                    None
                }
            }
        })
    }

    pub fn last_error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<String>> {
        self.error.subscribe()
    }
}

impl Drop for PeripheralScanner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
