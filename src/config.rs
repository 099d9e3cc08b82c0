//! Engine configuration loaded from TOML, the environment, or defaults
//!
//! The configuration is installed globally once. Components read it lazily
//! the first time they need a default (buffer pool sizes, string encoding).

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::layout::AlignmentMode;

static CONFIG: OnceCell<BridgeConfig> = OnceCell::new();

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub strings: StringConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub callbacks: CallbackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Mode given to definitions that do not choose one
    #[serde(default)]
    pub default_alignment: AlignmentMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringConfig {
    /// Narrow string encoding: `utf-8` or `latin-1`
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_thread_buffer_size")]
    pub thread_buffer_size: usize,

    #[serde(default = "default_thread_buffer_count")]
    pub thread_buffer_count: usize,

    #[serde(default = "default_global_max_size")]
    pub global_max_size: usize,

    #[serde(default = "default_global_items_per_size")]
    pub global_items_per_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Evict bindings of dropped callbacks on every lookup
    #[serde(default = "default_true")]
    pub purge_on_lookup: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            default_alignment: AlignmentMode::PlatformDefault,
        }
    }
}

impl Default for StringConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_buffer_size: default_thread_buffer_size(),
            thread_buffer_count: default_thread_buffer_count(),
            global_max_size: default_global_max_size(),
            global_items_per_size: default_global_items_per_size(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            purge_on_lookup: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_encoding() -> String { "utf-8".to_string() }
fn default_thread_buffer_size() -> usize { 128 }
fn default_thread_buffer_count() -> usize { 8 }
fn default_global_max_size() -> usize { 512 }
fn default_global_items_per_size() -> usize { 128 }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `NATIVE_BRIDGE_*` overrides on top of this configuration
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("NATIVE_BRIDGE_ALIGNMENT") {
            match mode.parse::<AlignmentMode>() {
                Ok(mode) => self.layout.default_alignment = mode,
                Err(err) => tracing::warn!(value = %mode, error = %err, "ignoring NATIVE_BRIDGE_ALIGNMENT"),
            }
        }
        if let Ok(encoding) = std::env::var("NATIVE_BRIDGE_ENCODING") {
            self.strings.encoding = encoding;
        }
        if let Some(size) = env_usize("NATIVE_BRIDGE_POOL_BUFFER_SIZE") {
            self.pool.thread_buffer_size = size;
        }
        if let Some(count) = env_usize("NATIVE_BRIDGE_POOL_BUFFER_COUNT") {
            self.pool.thread_buffer_count = count;
        }
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "ignoring non-numeric override");
            None
        }
    }
}

/// Install the global configuration
///
/// Returns `false` if a configuration was already installed or read.
pub fn install(config: BridgeConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// The global configuration, initialized from the environment on first use
pub fn current() -> &'static BridgeConfig {
    CONFIG.get_or_init(BridgeConfig::from_env)
}
