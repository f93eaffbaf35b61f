//! WiFi 外设发现
//!
//! 开发板在局域网内通过 mDNS 广播 web workflow 服务。

pub mod mdns;

pub use mdns::WifiDiscovery;
