//! 日志初始化
//!
//! stderr 始终输出；指定日志目录时额外写入每日轮转的日志文件（非阻塞写入）。

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// `RUST_LOG` 未设置时使用的过滤规则
pub const DEFAULT_FILTER: &str = "blackbox=info,blackbox_driver=info,blackbox_can=info";

const LOG_FILE_PREFIX: &str = "blackbox.log";

/// 安装全局日志订阅者
///
/// 返回的 guard 必须在进程生命周期内持有，drop 时刷新文件日志。
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .try_init()
            .context("installing log subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("installing log subscriber")?;
    Ok(Some(guard))
}
