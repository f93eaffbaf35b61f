//! BLE 绑定状态跟踪
//!
//! 平台的绑定变化通知（Android 的广播、BlueZ 的 `Paired` 属性等）通过
//! [`BondEventSource`] 接入。[`BondStateTracker::subscribe`] 在订阅时注册监听，
//! 返回的 [`BondStateStream`] 被 drop 时注销监听，且只注销一次。
//!
//! 注意：从不 drop 的流会一直占用一个监听器，这是调用方的责任。

use futures_util::Stream;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// 单个订阅在消费方处理不过来时最多缓存的事件数
const STREAM_BUFFER: usize = 64;

/// 平台绑定状态常量
pub const BOND_NONE: i32 = 10;
pub const BOND_BONDING: i32 = 11;
pub const BOND_BONDED: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BondState {
    #[default]
    Unknown,
    NotBonded,
    Bonding,
    Bonded,
}

impl BondState {
    /// 从平台整数值映射，未知值一律映射为 `Unknown`
    pub fn from_platform(value: i32) -> Self {
        match value {
            BOND_NONE => BondState::NotBonded,
            BOND_BONDING => BondState::Bonding,
            BOND_BONDED => BondState::Bonded,
            _ => BondState::Unknown,
        }
    }
}

/// 平台推送的原始绑定事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondEvent {
    pub address: String,
    pub raw_state: i32,
}

/// 解码后的绑定状态更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondUpdate {
    pub address: String,
    pub state: BondState,
}

pub type ListenerId = u64;

/// 监听回调，可能在任意线程上被调用
pub type BondListener = Arc<dyn Fn(&BondEvent) + Send + Sync>;

/// 绑定事件来源
pub trait BondEventSource: Send + Sync {
    fn register(&self, listener: BondListener) -> ListenerId;

    fn unregister(&self, id: ListenerId);

    /// 最近一次见到的原始状态，可选实现
    fn last_known(&self, _address: &str) -> Option<i32> {
        None
    }
}

#[derive(Default)]
struct BusInner {
    next_id: ListenerId,
    listeners: HashMap<ListenerId, BondListener>,
    last_known: HashMap<String, i32>,
}

/// 进程内的绑定事件总线
///
/// 平台胶水代码调用 [`BondEventBus::publish`] 推送事件。
#[derive(Default)]
pub struct BondEventBus {
    inner: Mutex<BusInner>,
}

impl BondEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, event: BondEvent) {
        let listeners: Vec<BondListener> = {
            let mut inner = self.lock();
            inner
                .last_known
                .insert(event.address.to_uppercase(), event.raw_state);
            inner.listeners.values().cloned().collect()
        };
        trace!(
            "Bond event {} -> {} ({} listener(s))",
            event.address,
            event.raw_state,
            listeners.len()
        );
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl BondEventSource for BondEventBus {
    fn register(&self, listener: BondListener) -> ListenerId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.insert(id, listener);
        debug!("Bond listener {} registered", id);
        id
    }

    fn unregister(&self, id: ListenerId) {
        if self.lock().listeners.remove(&id).is_some() {
            debug!("Bond listener {} unregistered", id);
        }
    }

    fn last_known(&self, address: &str) -> Option<i32> {
        self.lock().last_known.get(&address.to_uppercase()).copied()
    }
}

/// 跟踪器自己的监听和按地址记录的最新状态
struct TrackerInner {
    source: Arc<dyn BondEventSource>,
    states: Arc<Mutex<HashMap<String, BondState>>>,
    listener: ListenerId,
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        self.source.unregister(self.listener);
    }
}

#[derive(Clone)]
pub struct BondStateTracker {
    inner: Arc<TrackerInner>,
}

impl BondStateTracker {
    /// 注册一个常驻监听，记录每个地址最近一次的状态
    pub fn new(source: Arc<dyn BondEventSource>) -> Self {
        let states: Arc<Mutex<HashMap<String, BondState>>> = Arc::default();
        let recorder = states.clone();
        let listener = source.register(Arc::new(move |event: &BondEvent| {
            recorder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    event.address.to_uppercase(),
                    BondState::from_platform(event.raw_state),
                );
        }));
        Self {
            inner: Arc::new(TrackerInner {
                source,
                states,
                listener,
            }),
        }
    }

    /// 订阅绑定状态变化
    ///
    /// `filter` 为 `None` 时接收所有地址的事件。
    pub fn subscribe(&self, filter: Option<String>) -> BondStateStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let listener: BondListener = Arc::new(move |event: &BondEvent| {
            if let Some(address) = &filter {
                if !event.address.eq_ignore_ascii_case(address) {
                    return;
                }
            }
            let update = BondUpdate {
                address: event.address.clone(),
                state: BondState::from_platform(event.raw_state),
            };
            match tx.try_send(update) {
                Ok(()) => {}
                Err(TrySendError::Full(update)) => {
                    warn!(
                        "Bond subscriber is lagging, dropped update for {}",
                        update.address
                    );
                }
                Err(TrySendError::Closed(update)) => {
                    debug!("Bond subscriber closed, dropped update for {}", update.address);
                }
            }
        });

        let source = self.inner.source.clone();
        let id = source.register(listener);
        BondStateStream {
            rx,
            registration: Some((source, id)),
        }
    }

    /// 最近一次收到的状态；跟踪器创建前的状态向事件源查询
    pub fn current(&self, address: &str) -> BondState {
        let seen = self
            .inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address.to_uppercase())
            .copied();
        seen.unwrap_or_else(|| {
            self.inner
                .source
                .last_known(address)
                .map_or(BondState::Unknown, BondState::from_platform)
        })
    }
}

/// 绑定状态流，drop 时注销底层监听
pub struct BondStateStream {
    rx: mpsc::Receiver<BondUpdate>,
    registration: Option<(Arc<dyn BondEventSource>, ListenerId)>,
}

impl BondStateStream {
    pub async fn recv(&mut self) -> Option<BondUpdate> {
        self.rx.recv().await
    }

    fn release(&mut self) {
        if let Some((source, id)) = self.registration.take() {
            source.unregister(id);
        }
        self.rx.close();
    }
}

impl Stream for BondStateStream {
    type Item = BondUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for BondStateStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(address: &str, raw_state: i32) -> BondEvent {
        BondEvent {
            address: address.to_string(),
            raw_state,
        }
    }

    #[test]
    fn test_from_platform_is_total() {
        assert_eq!(BondState::from_platform(10), BondState::NotBonded);
        assert_eq!(BondState::from_platform(11), BondState::Bonding);
        assert_eq!(BondState::from_platform(12), BondState::Bonded);
        for raw in [i32::MIN, -1, 0, 9, 13, 999, i32::MAX] {
            assert_eq!(BondState::from_platform(raw), BondState::Unknown);
        }
    }

    #[tokio::test]
    async fn test_unfiltered_stream_preserves_order() {
        let bus = Arc::new(BondEventBus::new());
        let tracker = BondStateTracker::new(bus.clone());
        let mut stream = tracker.subscribe(None);

        bus.publish(event("AA:AA", BOND_BONDING));
        bus.publish(event("BB:BB", BOND_NONE));
        bus.publish(event("AA:AA", BOND_BONDING));
        bus.publish(event("AA:AA", BOND_BONDED));

        let states: Vec<_> = (&mut stream).take(4).map(|u| u.state).collect().await;
        assert_eq!(
            states,
            vec![
                BondState::Bonding,
                BondState::NotBonded,
                BondState::Bonding,
                BondState::Bonded
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_drops_other_addresses() {
        let bus = Arc::new(BondEventBus::new());
        let tracker = BondStateTracker::new(bus.clone());
        let mut stream = tracker.subscribe(Some("aa:aa".to_string()));

        bus.publish(event("BB:BB", BOND_BONDED));
        bus.publish(event("AA:AA", 42));

        let update = stream.recv().await.unwrap();
        assert_eq!(update.address, "AA:AA");
        assert_eq!(update.state, BondState::Unknown);
    }

    #[tokio::test]
    async fn test_drop_unregisters_once() {
        struct CountingSource {
            bus: BondEventBus,
            unregistered: AtomicUsize,
        }

        impl BondEventSource for CountingSource {
            fn register(&self, listener: BondListener) -> ListenerId {
                self.bus.register(listener)
            }

            fn unregister(&self, id: ListenerId) {
                self.unregistered.fetch_add(1, Ordering::SeqCst);
                self.bus.unregister(id);
            }
        }

        let source = Arc::new(CountingSource {
            bus: BondEventBus::new(),
            unregistered: AtomicUsize::new(0),
        });
        let tracker = BondStateTracker::new(source.clone());

        // 跟踪器本身占用一个监听
        assert_eq!(source.bus.listener_count(), 1);
        let stream = tracker.subscribe(None);
        assert_eq!(source.bus.listener_count(), 2);
        drop(stream);
        assert_eq!(source.bus.listener_count(), 1);
        assert_eq!(source.unregistered.load(Ordering::SeqCst), 1);

        drop(tracker);
        assert_eq!(source.bus.listener_count(), 0);
        assert_eq!(source.unregistered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_current_without_source_history() {
        // 只推送事件、不记录历史的事件源
        struct PushOnly(BondEventBus);

        impl BondEventSource for PushOnly {
            fn register(&self, listener: BondListener) -> ListenerId {
                self.0.register(listener)
            }

            fn unregister(&self, id: ListenerId) {
                self.0.unregister(id);
            }
        }

        let source = Arc::new(PushOnly(BondEventBus::new()));
        let tracker = BondStateTracker::new(source.clone());
        assert_eq!(tracker.current("AA:AA"), BondState::Unknown);

        source.0.publish(event("aa:aa", BOND_BONDING));
        assert_eq!(tracker.current("AA:AA"), BondState::Bonding);
        source.0.publish(event("AA:AA", BOND_BONDED));
        assert_eq!(tracker.current("aa:aa"), BondState::Bonded);
        source.0.publish(event("AA:AA", BOND_NONE));
        assert_eq!(tracker.current("AA:AA"), BondState::NotBonded);
    }

    #[test]
    fn test_publish_after_consumer_gone_does_not_panic() {
        let bus = Arc::new(BondEventBus::new());
        let tracker = BondStateTracker::new(bus.clone());
        let stream = tracker.subscribe(None);
        drop(stream);
        bus.publish(event("AA:AA", BOND_BONDED));
        assert_eq!(tracker.current("aa:aa"), BondState::Bonded);
        assert_eq!(tracker.current("CC:CC"), BondState::Unknown);
    }

    #[test]
    fn test_lagging_subscriber_drops_excess() {
        let bus = Arc::new(BondEventBus::new());
        let tracker = BondStateTracker::new(bus.clone());
        let mut stream = tracker.subscribe(None);
        for _ in 0..STREAM_BUFFER + 10 {
            bus.publish(event("AA:AA", BOND_BONDING));
        }
        let mut received = 0;
        while stream.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, STREAM_BUFFER);
    }
}
