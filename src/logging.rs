// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging Setup
//!
//! Installs a `tracing-subscriber` pipeline for binaries embedding the adapter.
//!
//! - `LOG_LEVEL`: error, warn, info, debug or trace (default info)
//! - `LOG_FORMAT`: json, pretty or compact (default compact)
//! - `RUST_LOG`: overrides the filter entirely

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> LogFormat {
        match value.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber. Calling it twice keeps the first subscriber.
pub fn init(level: Level, format: LogFormat) {
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| EnvFilter::try_new(rust_log).ok())
        .unwrap_or_else(|| {
            // lapin and its executor are chatty below warn.
            EnvFilter::new(format!("{},lapin=warn,async_io=warn,polling=warn", level))
        });

    let subscriber = tracing_subscriber::registry().with(filter);

    let _ = match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => subscriber.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => subscriber
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
    };
}

/// Installs the global subscriber configured from `LOG_LEVEL` and `LOG_FORMAT`.
pub fn init_from_env() {
    let level = env::var("LOG_LEVEL")
        .map(|v| parse_level(&v))
        .unwrap_or(Level::INFO);
    let format = env::var("LOG_FORMAT")
        .map(|v| LogFormat::parse(&v))
        .unwrap_or(LogFormat::Compact);

    init(level, format);
}
