//! 黑匣子控制器主入口
//!
//! ```bash
//! # 使用默认配置（can0, ai/vision_server.py）
//! blackbox
//!
//! # 虚拟 CAN 接口 + 事件录制
//! blackbox --interface vcan0 --record
//!
//! # 配置文件 + 日志文件
//! blackbox --config /etc/blackbox.toml --log-dir /var/log/blackbox
//! ```
//!
//! 退出码：0 正常关闭（Ctrl+C），1 启动失败，2 运行期致命错误。

mod cli;
mod logging;

use anyhow::Result;
use blackbox_driver::{BlackboxBuilder, BlackboxConfig};
use clap::Parser;
use cli::Args;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// 启动阶段失败的退出码
const EXIT_INIT: u8 = 1;

fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = match logging::init(args.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::from(EXIT_INIT);
        },
    };

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::from(EXIT_INIT);
        },
    };

    if args.print_config {
        return match config.to_toml() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            },
            Err(e) => {
                error!("Failed to serialize configuration: {}", e);
                ExitCode::from(EXIT_INIT)
            },
        };
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_signal_handler(shutdown.clone()) {
        error!("{:#}", e);
        return ExitCode::from(EXIT_INIT);
    }

    run(config, &shutdown)
}

/// Ctrl+C / SIGTERM 只置位关闭标志，由控制循环完成有序关闭
fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if !shutdown.swap(true, Ordering::SeqCst) {
            eprintln!("\nReceived interrupt signal. Shutting down...");
        }
    })?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn run(config: BlackboxConfig, shutdown: &AtomicBool) -> ExitCode {
    info!(
        "Blackbox starting (interface {}, worker {}, tick {} ms)",
        config.can.interface,
        config.worker.script.display(),
        config.cycle.tick_ms
    );

    let mut controller = match BlackboxBuilder::new(config).build() {
        Ok(controller) => controller,
        Err(e) => {
            error!("{}", e);
            return exit_code(e.exit_code());
        },
    };

    info!("Blackbox started. Press Ctrl+C to stop.");
    match controller.run(shutdown) {
        Ok(()) => {
            info!("Blackbox stopped");
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!("Blackbox terminated: {}", e);
            exit_code(e.exit_code())
        },
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_config: BlackboxConfig, _shutdown: &AtomicBool) -> ExitCode {
    error!("SocketCAN is only available on Linux");
    ExitCode::from(EXIT_INIT)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_INIT))
}
