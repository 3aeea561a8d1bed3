// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Bridge configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Matching `log` crate filter
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Namespace the session connects to at bootstrap
    pub root_namespace: String,
    /// Query language passed with every query
    pub query_language: String,
    /// Polling interval (`WITHIN` clause) for event queries, in seconds
    pub event_poll_interval_secs: u32,
    /// Indentation unit used when rendering value trees
    pub indentation: String,
    /// Maximum nesting depth for embedded objects; unbounded when absent
    pub max_depth: Option<usize>,
    pub log_level: LogLevel,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            root_namespace: "ROOT".into(),
            query_language: "WQL".into(),
            event_poll_interval_secs: 1,
            indentation: "\t".into(),
            max_depth: None,
            log_level: LogLevel::Info,
        }
    }
}

impl BridgeConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("Cannot read {}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no session can work with
    pub fn validate(&self) -> Result<()> {
        if self.root_namespace.trim().is_empty() {
            return Err(Error::Configuration("root_namespace is empty".into()));
        }
        if self.query_language.trim().is_empty() {
            return Err(Error::Configuration("query_language is empty".into()));
        }
        if self.event_poll_interval_secs == 0 {
            return Err(Error::Configuration(
                "event_poll_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Generate sample config
    pub fn sample_toml() -> String {
        r#"# WMI Bridge Configuration
root_namespace = "ROOT"
query_language = "WQL"
event_poll_interval_secs = 1
indentation = "\t"
# Stop expanding embedded objects below this depth (unbounded when unset)
# max_depth = 8
log_level = "Info"
"#
        .into()
    }
}
