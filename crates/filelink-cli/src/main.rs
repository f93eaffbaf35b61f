//! Filelink CLI
//!
//! 扫描附近的开发板，并通过 BLE 或 WiFi 管理板上的文件。

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use filelink_core::{AppSettings, LogLevel};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filelink", version, about = "BLE / WiFi 开发板文件传输工具")]
struct Cli {
    /// 日志级别 (error/warn/info/debug/trace)，覆盖配置文件
    #[arg(long, global = true, value_parser = parse_level)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

/// 目标外设
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// BLE 地址
    #[arg(long, conflicts_with = "wifi", required_unless_present = "wifi")]
    pub ble: Option<String>,
    /// WiFi 主机，形如 host 或 host:port
    #[arg(long)]
    pub wifi: Option<String>,
    /// BLE 外设已经在系统中配对
    #[arg(long, requires = "ble")]
    pub bonded: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// 同时通过 mDNS 发现 WiFi 设备
        #[arg(long)]
        wifi: bool,
    },
    /// 列出目录
    Ls {
        #[command(flatten)]
        target: Target,
        #[arg(default_value = "/")]
        path: String,
    },
    /// 读取文件
    Cat {
        #[command(flatten)]
        target: Target,
        path: String,
        /// 保存到本地文件而不是输出到终端
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 上传本地文件
    Put {
        #[command(flatten)]
        target: Target,
        local: PathBuf,
        remote: String,
    },
    /// 删除文件或空目录
    Rm {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// 创建目录
    Mkdir {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// 移动或重命名
    Mv {
        #[command(flatten)]
        target: Target,
        from: String,
        to: String,
    },
    /// 查看文件信息
    Stat {
        #[command(flatten)]
        target: Target,
        path: String,
    },
    /// 显示配置文件位置
    Config {
        /// 写入默认配置（文件不存在时）
        #[arg(long)]
        init: bool,
    },
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    s.parse()
        .map_err(|()| format!("unknown log level '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load();
    let level = cli.log_level.unwrap_or(settings.log_level);

    // 桥接 log crate（filelink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();

    match cli.command {
        Commands::Scan { timeout, wifi } => commands::scan(&settings, timeout, wifi).await,
        Commands::Ls { target, path } => commands::ls(&settings, &target, &path).await,
        Commands::Cat {
            target,
            path,
            output,
        } => commands::cat(&settings, &target, &path, output.as_deref()).await,
        Commands::Put {
            target,
            local,
            remote,
        } => commands::put(&settings, &target, &local, &remote).await,
        Commands::Rm { target, path } => commands::rm(&settings, &target, &path).await,
        Commands::Mkdir { target, path } => commands::mkdir(&settings, &target, &path).await,
        Commands::Mv { target, from, to } => commands::mv(&settings, &target, &from, &to).await,
        Commands::Stat { target, path } => commands::stat(&settings, &target, &path).await,
        Commands::Config { init } => commands::config(&settings, init),
    }
}
