//! 外设模型
//!
//! BLE 与 WiFi 两种外设通过 [`Peripheral`] trait 统一访问；
//! 扫描器与连接管理器内部使用带标签的 [`AnyPeripheral`]。
//! 身份只由 `address` 决定。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Ble,
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Wifi => write!(f, "WiFi"),
        }
    }
}

/// 外设的公共能力
pub trait Peripheral {
    fn address(&self) -> &str;

    fn name(&self) -> Option<&str>;

    fn created_millis(&self) -> u64;

    fn transport(&self) -> TransportKind;

    fn name_or_address(&self) -> &str {
        self.name().unwrap_or_else(|| self.address())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlePeripheral {
    address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    created_millis: u64,
    pub last_seen_millis: u64,
}

impl BlePeripheral {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        let now = now_millis();
        Self {
            address: address.into(),
            name,
            rssi,
            created_millis: now,
            last_seen_millis: now,
        }
    }
}

impl Peripheral for BlePeripheral {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn created_millis(&self) -> u64 {
        self.created_millis
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }
}

pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiPeripheral {
    address: String,
    pub name: Option<String>,
    pub port: u16,
    created_millis: u64,
    pub last_seen_millis: u64,
}

impl WifiPeripheral {
    pub fn new(address: impl Into<String>, port: u16, name: Option<String>) -> Self {
        let now = now_millis();
        Self {
            address: address.into(),
            name,
            port,
            created_millis: now,
            last_seen_millis: now,
        }
    }

    /// 解析 `host`、`host:port` 或 `[v6]:port`
    pub fn parse(target: &str) -> Self {
        if let Some(rest) = target.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(DEFAULT_HTTP_PORT);
                return Self::new(host, port, None);
            }
        }
        match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => Self::new(host, port, None),
                Err(_) => Self::new(target, DEFAULT_HTTP_PORT, None),
            },
            _ => Self::new(target, DEFAULT_HTTP_PORT, None),
        }
    }

    /// `http://address[:port]`，端口为 80 时省略
    pub fn base_url(&self) -> String {
        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        if self.port == DEFAULT_HTTP_PORT {
            format!("http://{host}")
        } else {
            format!("http://{host}:{}", self.port)
        }
    }
}

impl Peripheral for WifiPeripheral {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn created_millis(&self) -> u64 {
        self.created_millis
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Wifi
    }
}

/// 扫描结果中的任意外设
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum AnyPeripheral {
    Ble(BlePeripheral),
    Wifi(WifiPeripheral),
}

impl AnyPeripheral {
    fn inner(&self) -> &dyn Peripheral {
        match self {
            AnyPeripheral::Ble(p) => p,
            AnyPeripheral::Wifi(p) => p,
        }
    }

    pub fn last_seen_millis(&self) -> u64 {
        match self {
            AnyPeripheral::Ble(p) => p.last_seen_millis,
            AnyPeripheral::Wifi(p) => p.last_seen_millis,
        }
    }

    /// 用新的目击信息原地更新可变字段，保留 `created_millis`
    pub fn absorb(&mut self, other: &AnyPeripheral) {
        match (self, other) {
            (AnyPeripheral::Ble(mine), AnyPeripheral::Ble(theirs)) => {
                if theirs.name.is_some() {
                    mine.name.clone_from(&theirs.name);
                }
                if theirs.rssi.is_some() {
                    mine.rssi = theirs.rssi;
                }
                mine.last_seen_millis = theirs.last_seen_millis;
            }
            (AnyPeripheral::Wifi(mine), AnyPeripheral::Wifi(theirs)) => {
                if theirs.name.is_some() {
                    mine.name.clone_from(&theirs.name);
                }
                mine.port = theirs.port;
                mine.last_seen_millis = theirs.last_seen_millis;
            }
            (mine, _) => {
                log::debug!(
                    "Ignoring sighting of {} over a different transport",
                    mine.address()
                );
            }
        }
    }
}

impl Peripheral for AnyPeripheral {
    fn address(&self) -> &str {
        self.inner().address()
    }

    fn name(&self) -> Option<&str> {
        self.inner().name()
    }

    fn created_millis(&self) -> u64 {
        self.inner().created_millis()
    }

    fn transport(&self) -> TransportKind {
        self.inner().transport()
    }
}

impl PartialEq for AnyPeripheral {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for AnyPeripheral {}

impl Hash for AnyPeripheral {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl From<BlePeripheral> for AnyPeripheral {
    fn from(p: BlePeripheral) -> Self {
        AnyPeripheral::Ble(p)
    }
}

impl From<WifiPeripheral> for AnyPeripheral {
    fn from(p: WifiPeripheral) -> Self {
        AnyPeripheral::Wifi(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_or_address() {
        let named = BlePeripheral::new("AA:BB:CC:DD:EE:FF", Some("CIRCUITPY".into()), None);
        assert_eq!(named.name_or_address(), "CIRCUITPY");
        let anon = BlePeripheral::new("AA:BB:CC:DD:EE:FF", None, None);
        assert_eq!(anon.name_or_address(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            WifiPeripheral::new("192.168.1.20", 80, None).base_url(),
            "http://192.168.1.20"
        );
        assert_eq!(
            WifiPeripheral::new("cpy-1234.local", 8080, None).base_url(),
            "http://cpy-1234.local:8080"
        );
        assert_eq!(WifiPeripheral::new("fe80::1", 80, None).base_url(), "http://[fe80::1]");
    }

    #[test]
    fn test_parse_wifi_spec() {
        let p = WifiPeripheral::parse("10.0.0.5:8080");
        assert_eq!(p.address(), "10.0.0.5");
        assert_eq!(p.port, 8080);

        let p = WifiPeripheral::parse("cpy.local");
        assert_eq!(p.address(), "cpy.local");
        assert_eq!(p.port, 80);

        let p = WifiPeripheral::parse("[fe80::1]:81");
        assert_eq!(p.address(), "fe80::1");
        assert_eq!(p.port, 81);
    }

    #[test]
    fn test_identity_by_address() {
        let a: AnyPeripheral = BlePeripheral::new("11:22", Some("a".into()), Some(-40)).into();
        let b: AnyPeripheral = BlePeripheral::new("11:22", None, Some(-90)).into();
        assert_eq!(a, b);
    }

    #[test]
    fn test_absorb_preserves_creation() {
        let mut known: AnyPeripheral = BlePeripheral::new("11:22", None, Some(-80)).into();
        let created = known.created_millis();

        let mut sighting = BlePeripheral::new("11:22", Some("board".into()), Some(-50));
        sighting.last_seen_millis = created + 1_000;
        known.absorb(&sighting.into());

        assert_eq!(known.created_millis(), created);
        assert_eq!(known.name(), Some("board"));
        assert_eq!(known.last_seen_millis(), created + 1_000);
        match known {
            AnyPeripheral::Ble(p) => assert_eq!(p.rssi, Some(-50)),
            AnyPeripheral::Wifi(_) => panic!("transport changed"),
        }
    }
}
