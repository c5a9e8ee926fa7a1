//! 日志与追踪系统
//! 初始化结构化日志：控制台输出 + 可选的日志文件（追加写入）

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{AppError, Result};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// 根据格式构建 fmt 层
fn fmt_layer<W>(format: &str, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

/// 初始化日志与追踪系统
///
/// 控制台日志级别取自 RUST_LOG 或配置；日志文件始终记录 debug 及以上级别
pub fn init_telemetry(config: &LoggingConfig) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.enable_console {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));
        layers.push(fmt_layer(&config.format, std::io::stderr, true).with_filter(env_filter).boxed());
    }

    if let Some(file) = &config.file {
        let path = Path::new(file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Config(format!("Failed to create log directory: {}", e)))?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AppError::Config(format!("Failed to open log file {}: {}", file, e)))?;

        layers.push(
            fmt_layer(&config.format, Mutex::new(log_file), false)
                .with_filter(EnvFilter::new("debug"))
                .boxed(),
        );
    }

    // 初始化 subscriber
    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| AppError::Config(format!("Failed to initialize telemetry: {}", e)))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Telemetry initialized"
    );

    Ok(())
}
