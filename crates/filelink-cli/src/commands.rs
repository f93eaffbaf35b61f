//! 子命令实现

use anyhow::{Context, Result};
use filelink_core::bond::BOND_BONDED;
use filelink_core::{
    AnyPeripheral, AppSettings, BleDiscovery, BlePeripheral, BondEvent, BondEventBus,
    BondStateTracker, DirectoryEntry, DiscoverySource, FileTransferConnectionManager, Peripheral,
    PeripheralScanner, PlatformConnector, ScanUpdate, WifiDiscovery, WifiPeripheral,
};
use futures_util::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Target;

pub async fn scan(settings: &AppSettings, timeout: u64, wifi: bool) -> Result<()> {
    let mut sources: Vec<Arc<dyn DiscoverySource>> = vec![Arc::new(BleDiscovery::new(
        settings.scan.name_filter.clone(),
    ))];
    if wifi {
        sources.push(Arc::new(WifiDiscovery::new(
            settings.scan.mdns_service.clone(),
        )));
    }

    let scanner = PeripheralScanner::new(settings.scan.clone(), sources);
    let mut updates = Box::pin(scanner.subscribe());

    println!("🔍 Scanning for {} seconds...", timeout);
    scanner.start().await;

    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(update) = updates.next() => match update {
                ScanUpdate::Added(p) => println!("  + {}", describe(&p)),
                ScanUpdate::Removed(p) => println!("  - {}", describe(&p)),
                ScanUpdate::Updated(p) => debug!("Updated {}", describe(&p)),
            },
        }
    }
    scanner.stop().await;

    let peripherals = scanner.peripherals();
    if peripherals.is_empty() {
        println!("📭 No devices found");
    } else {
        println!("\n📡 Found {} device(s):", peripherals.len());
        for (i, p) in peripherals.iter().enumerate() {
            println!("  [{}] {}", i + 1, describe(p));
        }
    }
    if let Some(err) = scanner.last_error() {
        warn!("Scan error: {}", err);
        println!("⚠️  {}", err);
    }
    Ok(())
}

pub async fn ls(settings: &AppSettings, target: &Target, path: &str) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.list_directory(path).await;
    manager.disconnect(None).await;

    for entry in &result? {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

pub async fn cat(
    settings: &AppSettings,
    target: &Target,
    path: &str,
    output: Option<&Path>,
) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.read_file(path).await;
    manager.disconnect(None).await;

    let data = result?;
    match output {
        Some(local) => {
            std::fs::write(local, &data)
                .with_context(|| format!("failed to write {}", local.display()))?;
            println!("✅ Saved {} bytes to {}", data.len(), local.display());
        }
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

pub async fn put(
    settings: &AppSettings,
    target: &Target,
    local: &Path,
    remote: &str,
) -> Result<()> {
    let data =
        std::fs::read(local).with_context(|| format!("failed to read {}", local.display()))?;

    let manager = connect(settings, target).await?;
    let result = manager.write_file(remote, &data).await;
    manager.disconnect(None).await;

    let receipt = result?;
    println!("✅ Wrote {} bytes to {}", receipt.bytes_written, remote);
    Ok(())
}

pub async fn rm(settings: &AppSettings, target: &Target, path: &str) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.delete(path).await;
    manager.disconnect(None).await;

    result?;
    println!("✅ Deleted {}", path);
    Ok(())
}

pub async fn mkdir(settings: &AppSettings, target: &Target, path: &str) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.make_directory(path).await;
    manager.disconnect(None).await;

    result?;
    println!("✅ Created {}", path);
    Ok(())
}

pub async fn mv(settings: &AppSettings, target: &Target, from: &str, to: &str) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.move_path(from, to).await;
    manager.disconnect(None).await;

    result?;
    println!("✅ Moved {} -> {}", from, to);
    Ok(())
}

pub async fn stat(settings: &AppSettings, target: &Target, path: &str) -> Result<()> {
    let manager = connect(settings, target).await?;
    let result = manager.stat(path).await;
    manager.disconnect(None).await;

    let stat = result?;
    println!("Path:      {}", stat.path);
    println!(
        "Type:      {}",
        if stat.is_directory { "directory" } else { "file" }
    );
    println!("Size:      {}", stat.size);
    if let Some(ns) = stat.modified_ns {
        println!("Modified:  {} ns", ns);
    }
    Ok(())
}

pub fn config(settings: &AppSettings, init: bool) -> Result<()> {
    let path = AppSettings::config_path();
    println!("{}", path.display());
    if init {
        if path.exists() {
            println!("Config already exists, leaving it untouched");
        } else {
            settings.save_to(&path)?;
            println!("✅ Wrote default settings");
        }
    }
    Ok(())
}

/// 建立到目标外设的会话
async fn connect(settings: &AppSettings, target: &Target) -> Result<FileTransferConnectionManager> {
    let bus = Arc::new(BondEventBus::new());
    let peripheral = resolve(target);
    if target.bonded {
        bus.publish(BondEvent {
            address: peripheral.address().to_string(),
            raw_state: BOND_BONDED,
        });
    }

    let manager = FileTransferConnectionManager::new(
        settings.connection.clone(),
        Arc::new(PlatformConnector::new(settings.ble.clone())),
        BondStateTracker::new(bus),
    );

    info!("Connecting to {}", describe(&peripheral));
    manager
        .connect(peripheral.clone())
        .await
        .with_context(|| format!("failed to connect to {}", peripheral.name_or_address()))?;
    Ok(manager)
}

fn resolve(target: &Target) -> AnyPeripheral {
    match (&target.ble, &target.wifi) {
        (Some(address), _) => BlePeripheral::new(address.clone(), None, None).into(),
        (None, Some(host)) => WifiPeripheral::parse(host).into(),
        // clap 已保证二者之一存在
        (None, None) => WifiPeripheral::parse("circuitpython.local").into(),
    }
}

fn describe(peripheral: &AnyPeripheral) -> String {
    match peripheral {
        AnyPeripheral::Ble(p) => match p.rssi {
            Some(rssi) => format!("[BLE]  {} ({}) {} dBm", p.name_or_address(), p.address(), rssi),
            None => format!("[BLE]  {} ({})", p.name_or_address(), p.address()),
        },
        AnyPeripheral::Wifi(p) => {
            format!("[WiFi] {} ({})", p.name_or_address(), p.base_url())
        }
    }
}

fn format_entry(entry: &DirectoryEntry) -> String {
    if entry.is_directory {
        format!("{:>10}  {}/", "-", entry.name)
    } else {
        format!("{:>10}  {}", entry.size, entry.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_target() {
        let ble = Target {
            ble: Some("AA:BB".into()),
            wifi: None,
            bonded: false,
        };
        assert!(matches!(resolve(&ble), AnyPeripheral::Ble(p) if p.address() == "AA:BB"));

        let wifi = Target {
            ble: None,
            wifi: Some("cpy-1234.local:8080".into()),
            bonded: false,
        };
        match resolve(&wifi) {
            AnyPeripheral::Wifi(p) => assert_eq!(p.base_url(), "http://cpy-1234.local:8080"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_format_entry() {
        let dir = DirectoryEntry {
            name: "lib".into(),
            is_directory: true,
            size: 0,
            modified_ns: None,
        };
        assert!(format_entry(&dir).ends_with("lib/"));

        let file = DirectoryEntry {
            name: "code.py".into(),
            is_directory: false,
            size: 42,
            modified_ns: None,
        };
        assert_eq!(format_entry(&file), "        42  code.py");
    }
}
