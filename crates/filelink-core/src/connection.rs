//! 文件传输连接管理器
//!
//! 每个实例最多持有一个活动连接。所有状态转换都在同一把异步锁内完成，
//! 状态的发布也在锁内进行，因此观察者看到的转换顺序与实际顺序一致。
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │
//!       └───────── failure ──────┘     link lost / disconnect
//!       ▲                                           │
//!       └──── exhausted ──── Reconnecting ◀─reconnect
//! ```
//!
//! 文件操作只在 `Connected` 时可用。超时和普通错误不改变状态；
//! 链路断开类错误会把状态转为 `Disconnected(LinkLost)`。

use log::{debug, info, warn};
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::bond::{BondState, BondStateStream, BondStateTracker};
use crate::config::{ConnectionConfig, ReconnectPolicy};
use crate::error::{Result, TransferError};
use crate::path;
use crate::peripheral::{AnyPeripheral, Peripheral};
use crate::transfer::{DirectoryEntry, FileStat, FileTransport, TransportConnector, WriteReceipt};

/// 进入 `Disconnected` 的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    Requested,
    ConnectFailed(String),
    LinkLost(String),
    ReconnectFailed,
    /// 连接期间绑定失败或被移除
    BondRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { cause: Option<DisconnectCause> },
    Connecting(AnyPeripheral),
    Connected(AnyPeripheral),
    Reconnecting(AnyPeripheral),
}

impl ConnectionState {
    pub fn peripheral(&self) -> Option<&AnyPeripheral> {
        match self {
            ConnectionState::Disconnected { .. } => None,
            ConnectionState::Connecting(p)
            | ConnectionState::Connected(p)
            | ConnectionState::Reconnecting(p) => Some(p),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected { .. })
    }
}

struct Session {
    id: u64,
    peripheral: AnyPeripheral,
    transport: Arc<dyn FileTransport>,
    /// 取消该会话的绑定监视任务
    watcher: CancellationToken,
}

#[derive(Default)]
struct Transitions {
    last_peripheral: Option<AnyPeripheral>,
    next_session: u64,
}

struct Shared {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    bonds: BondStateTracker,
    transitions: Mutex<Transitions>,
    /// 只在 `Connected` 时为 `Some`，持锁期间不 await
    active: StdMutex<Option<Session>>,
    /// 正在进行的重连，`disconnect` 不经转换锁即可取消
    reconnecting: StdMutex<Option<CancellationToken>>,
    state: watch::Sender<ConnectionState>,
}

fn jitter(policy: &ReconnectPolicy) -> Duration {
    if policy.jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=policy.jitter_ms))
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<Session>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconnecting(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.reconnecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: ConnectionState) {
        debug!("Connection state -> {:?}", state);
        self.state.send_replace(state);
    }

    async fn open(&self, peripheral: &AnyPeripheral) -> Result<Arc<dyn FileTransport>> {
        let limit = self.config.connect_timeout();
        match tokio::time::timeout(limit, self.connector.open(peripheral)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(limit)),
        }
    }

    /// 安装新会话并发布 `Connected`，调用方持有转换锁
    fn install(
        self: &Arc<Self>,
        transitions: &mut Transitions,
        peripheral: AnyPeripheral,
        transport: Arc<dyn FileTransport>,
    ) {
        transitions.next_session += 1;
        let id = transitions.next_session;
        let watcher = CancellationToken::new();

        if let AnyPeripheral::Ble(ble) = &peripheral {
            if self.config.require_bond_for_writes {
                let stream = self.bonds.subscribe(Some(ble.address().to_string()));
                let bonded_before = matches!(
                    self.bonds.current(ble.address()),
                    BondState::Bonding | BondState::Bonded
                );
                tokio::spawn(watch_bond(
                    Arc::downgrade(self),
                    stream,
                    id,
                    bonded_before,
                    watcher.clone(),
                ));
            }
        }

        *self.active() = Some(Session {
            id,
            peripheral: peripheral.clone(),
            transport,
            watcher,
        });
        info!("Connected to {}", peripheral.name_or_address());
        self.publish(ConnectionState::Connected(peripheral));
    }

    /// 拆除当前会话（若有），不发布状态，调用方持有转换锁
    async fn teardown(&self) {
        let session = self.active().take();
        let Some(session) = session else {
            return;
        };
        session.watcher.cancel();
        let limit = self.config.operation_timeout();
        match tokio::time::timeout(limit, session.transport.close()).await {
            Ok(Ok(())) => debug!("Closed session with {}", session.peripheral.address()),
            Ok(Err(e)) => debug!("Error closing session: {}", e),
            Err(_) => warn!("Closing session timed out after {:?}", limit),
        }
    }

    /// 仅当 `id` 仍是活动会话时断开
    async fn end_session(&self, id: u64, cause: DisconnectCause) {
        let _transitions = self.transitions.lock().await;
        let current = self.active().as_ref().map(|s| s.id);
        if current != Some(id) {
            debug!("Session {} already ended", id);
            return;
        }
        warn!("Session {} ended: {:?}", id, cause);
        self.teardown().await;
        self.publish(ConnectionState::Disconnected { cause: Some(cause) });
    }

    fn current(&self) -> Result<(u64, AnyPeripheral, Arc<dyn FileTransport>)> {
        self.active()
            .as_ref()
            .map(|s| (s.id, s.peripheral.clone(), s.transport.clone()))
            .ok_or(TransferError::NotConnected)
    }
}

async fn watch_bond(
    shared: Weak<Shared>,
    mut stream: BondStateStream,
    id: u64,
    mut bonded_before: bool,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            () = cancel.cancelled() => return,
            update = stream.recv() => update,
        };
        let Some(update) = update else {
            return;
        };
        match update.state {
            BondState::Bonding | BondState::Bonded => bonded_before = true,
            BondState::NotBonded if bonded_before => {
                if let Some(shared) = shared.upgrade() {
                    info!("Bond with {} was lost", update.address);
                    shared.end_session(id, DisconnectCause::BondRequired).await;
                }
                return;
            }
            BondState::NotBonded | BondState::Unknown => {}
        }
    }
}

/// 单连接的文件传输管理器
pub struct FileTransferConnectionManager {
    shared: Arc<Shared>,
}

impl FileTransferConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn TransportConnector>,
        bonds: BondStateTracker,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected { cause: None });
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                bonds,
                transitions: Mutex::new(Transitions::default()),
                active: StdMutex::new(None),
                reconnecting: StdMutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn bonds(&self) -> &BondStateTracker {
        &self.shared.bonds
    }

    /// 连接到外设
    ///
    /// 当前状态不是 `Disconnected` 时返回 [`TransferError::ConnectionConflict`]，
    /// 状态保持不变。
    pub async fn connect(&self, peripheral: AnyPeripheral) -> Result<()> {
        let mut transitions = self.shared.transitions.lock().await;
        if let Some(active) = self.shared.state.borrow().peripheral() {
            return Err(TransferError::ConnectionConflict {
                address: active.address().to_string(),
            });
        }

        transitions.last_peripheral = Some(peripheral.clone());
        info!("Connecting to {}", peripheral.name_or_address());
        self.shared
            .publish(ConnectionState::Connecting(peripheral.clone()));

        match self.shared.open(&peripheral).await {
            Ok(transport) => {
                self.shared.install(&mut transitions, peripheral, transport);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", peripheral.address(), e);
                self.shared.publish(ConnectionState::Disconnected {
                    cause: Some(DisconnectCause::ConnectFailed(e.to_string())),
                });
                Err(e)
            }
        }
    }

    /// 重新连接上一次连接过的外设
    ///
    /// 按退避策略重试，全部失败时返回 `false`，从不返回错误。
    /// 期间调用 [`disconnect`](Self::disconnect) 会在下一个等待点中止重试。
    pub async fn reconnect(&self) -> bool {
        let mut transitions = self.shared.transitions.lock().await;
        let Some(peripheral) = transitions.last_peripheral.clone() else {
            debug!("Nothing to reconnect to");
            return false;
        };

        self.shared.teardown().await;
        self.shared
            .publish(ConnectionState::Reconnecting(peripheral.clone()));

        let cancel = CancellationToken::new();
        *self.shared.reconnecting() = Some(cancel.clone());
        let transport = self.retry(&peripheral, &cancel).await;
        self.shared.reconnecting().take();

        match transport {
            Some(transport) => {
                self.shared.install(&mut transitions, peripheral, transport);
                true
            }
            // 由 disconnect 发布最终状态
            None if cancel.is_cancelled() => {
                info!("Reconnect to {} cancelled", peripheral.address());
                false
            }
            None => {
                self.shared.publish(ConnectionState::Disconnected {
                    cause: Some(DisconnectCause::ReconnectFailed),
                });
                false
            }
        }
    }

    async fn retry(
        &self,
        peripheral: &AnyPeripheral,
        cancel: &CancellationToken,
    ) -> Option<Arc<dyn FileTransport>> {
        let policy = &self.shared.config.reconnect;
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let delay = policy.delay_before(attempt);
            let attempt_once = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay + jitter(policy)).await;
                }
                self.shared.open(peripheral).await
            };
            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                opened = attempt_once => opened,
            };
            match opened {
                Ok(transport) => {
                    info!("Reconnected on attempt {}/{}", attempt, attempts);
                    return Some(transport);
                }
                Err(e) => warn!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }
        None
    }

    /// 断开连接，任何状态下都以 `Disconnected` 结束
    pub async fn disconnect(&self, cause: Option<DisconnectCause>) {
        if let Some(cancel) = self.shared.reconnecting().as_ref() {
            cancel.cancel();
        }
        let _transitions = self.shared.transitions.lock().await;
        self.shared.teardown().await;
        self.shared.publish(ConnectionState::Disconnected {
            cause: Some(cause.unwrap_or(DisconnectCause::Requested)),
        });
    }

    async fn run<T, F, Fut>(&self, op: &'static str, write: bool, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn FileTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (id, peripheral, transport) = self.shared.current()?;
        if write {
            self.require_bond(&peripheral)?;
        }

        let limit = self.shared.config.operation_timeout();
        match tokio::time::timeout(limit, f(transport)).await {
            Err(_) => {
                warn!("{} timed out after {:?}", op, limit);
                Err(TransferError::Timeout(limit))
            }
            Ok(Err(e)) if e.is_link_loss() => {
                self.shared
                    .end_session(id, DisconnectCause::LinkLost(e.to_string()))
                    .await;
                Err(e)
            }
            Ok(result) => result,
        }
    }

    fn require_bond(&self, peripheral: &AnyPeripheral) -> Result<()> {
        let AnyPeripheral::Ble(ble) = peripheral else {
            return Ok(());
        };
        if !self.shared.config.require_bond_for_writes {
            return Ok(());
        }
        match self.shared.bonds.current(ble.address()) {
            BondState::Bonded => Ok(()),
            state => {
                debug!("Refusing write to {} in bond state {:?}", ble.address(), state);
                Err(TransferError::BondRequired {
                    address: ble.address().to_string(),
                })
            }
        }
    }

    pub async fn list_directory(&self, dir: &str) -> Result<Vec<DirectoryEntry>> {
        let dir = path::normalize(dir);
        self.run("list", false, |t| async move { t.list_directory(&dir).await })
            .await
    }

    pub async fn read_file(&self, file: &str) -> Result<Vec<u8>> {
        let file = path::normalize(file);
        self.run("read", false, |t| async move { t.read_file(&file).await })
            .await
    }

    pub async fn write_file(&self, file: &str, data: &[u8]) -> Result<WriteReceipt> {
        let file = path::normalize(file);
        self.run("write", true, |t| async move { t.write_file(&file, data).await })
            .await
    }

    pub async fn delete(&self, target: &str) -> Result<()> {
        let target = path::normalize(target);
        self.run("delete", true, |t| async move { t.delete(&target).await })
            .await
    }

    pub async fn stat(&self, target: &str) -> Result<FileStat> {
        let target = path::normalize(target);
        self.run("stat", false, |t| async move { t.stat(&target).await })
            .await
    }

    pub async fn make_directory(&self, dir: &str) -> Result<()> {
        let dir = path::normalize(dir);
        self.run("mkdir", true, |t| async move { t.make_directory(&dir).await })
            .await
    }

    pub async fn move_path(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.run("move", true, |t| async move { t.move_path(&from, &to).await })
            .await
    }
}

impl Drop for FileTransferConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.shared.active().as_ref() {
            session.watcher.cancel();
        }
    }
}
