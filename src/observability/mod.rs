//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖；日志写到 stderr，避免与 REPL 输出混在一起。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with(None);
}

/// 初始化日志；level 为未设置 RUST_LOG 时的默认过滤（如 "info"、"cadence=debug"）
pub fn init_with(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
