//! Logger module for flowrt
//!
//! Go-style simple logging: `[LEVEL] message key=value`
//!
//! # Usage
//!
//! ```rust
//! use flowrt::util::logger;
//!
//! logger::try_init();
//! tracing::info!(domain = 0, "runtime started");
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

fn build(level: LogLevel) -> impl SubscriberInitExt {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

    // Go 风格：显示 [LEVEL] 前缀，不显示时间，无颜色
    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    Registry::default().with(layer)
}

/// Initialize logger with default configuration (INFO level)
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logger with custom level. Panics if a global subscriber is
/// already installed.
pub fn init_with_level(level: LogLevel) {
    build(level).init();
}

/// Initialize logger for debug use (DEBUG level)
pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}

/// Like [`init`], but a no-op when a subscriber is already installed.
pub fn try_init() -> bool {
    try_init_with_level(LogLevel::Info)
}

/// Returns `false` when another subscriber was installed first.
pub fn try_init_with_level(level: LogLevel) -> bool {
    build(level).try_init().is_ok()
}
