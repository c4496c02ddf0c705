//! Configuration for jsbridge engines
//!
//! Settings can be built in code or loaded from a TOML file:
//!
//! ```toml
//! [engine]
//! allow_reflection = false
//! max_stack_size = 16777216
//! thread_name = "jsbridge-script"
//! collect_garbage_on_dispose = true
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DEFAULT_STACK_SIZE;
use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Smallest worker stack accepted by [`EngineSettings::validate`].
pub const MIN_STACK_SIZE: usize = 256 * 1024;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LogConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

/// Per-engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Expose introspection members (`GetType`, `GetHashCode`, ...) to script.
    #[serde(default)]
    pub allow_reflection: bool,

    /// Stack size of the dispatcher thread, in bytes.
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: usize,

    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Run a collection before the runtime is torn down.
    #[serde(default)]
    pub collect_garbage_on_dispose: bool,
}

fn default_max_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_thread_name() -> String {
    "jsbridge-script".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            allow_reflection: false,
            max_stack_size: default_max_stack_size(),
            thread_name: default_thread_name(),
            collect_garbage_on_dispose: false,
        }
    }
}

impl EngineSettings {
    /// Parse a bare `EngineSettings` table.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// The `[engine]` section of a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        Config::load(path).map(|config| config.engine)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_stack_size < MIN_STACK_SIZE {
            return Err(Error::Config(format!(
                "max_stack_size must be at least {MIN_STACK_SIZE} bytes, got {}",
                self.max_stack_size
            )));
        }
        if self.thread_name.trim().is_empty() {
            return Err(Error::Config("thread_name must not be empty".to_string()));
        }
        Ok(())
    }
}
