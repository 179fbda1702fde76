//! Defines the configuration structures for the lifecycle server.
//!
//! These structs are deserialized with `serde` through the `config` crate, so
//! the same settings can come from a TOML file, from `LIFECYCLE__*`
//! environment variables, or from both (the environment wins). Every field has
//! a default, so an empty source yields a working configuration.

use crate::error::LifecycleError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix of environment variables read by [`ServerConfig::load`].
pub const ENV_PREFIX: &str = "LIFECYCLE";
/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// The top-level configuration for the `Server`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in logs and in the shell banner.
    pub server_name: String,

    /// Secret the `token-factory` signs with. `start` fails without one.
    pub token_secret: Option<String>,

    pub logging: LoggingConfig,

    pub lifecycle: LifecycleConfig,

    /// How long the `lifecycled` binary waits for `stop` and `destroy` after
    /// Ctrl+C before giving up and exiting. The core itself never times out.
    pub shutdown_grace_ms: u64,

    /// Per-kind overrides for the component catalog, keyed by kind.
    pub components: BTreeMap<String, ComponentSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// A `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `lifecycle=debug,warn`. `RUST_LOG` takes precedence when set.
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub teardown: TeardownPolicy,
}

/// What a failing component does to the rest of a `stop` or `destroy` phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// A failure propagates to dependents and fails the phase at once,
    /// exactly like `init` and `start`.
    #[default]
    Strict,
    /// A dependency failure counts as settled so dependents still tear down;
    /// the phase reports every failure once all components have finished.
    BestEffort,
}

/// Settings for one catalog kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSettings {
    /// `false` removes the kind from the catalog before construction.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form options handed to the kind's factory.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Loads the configuration from an optional TOML file plus the
    /// `LIFECYCLE__*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self, LifecycleError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parses a configuration from TOML text. Environment variables are not
    /// consulted.
    pub fn from_toml(text: &str) -> Result<Self, LifecycleError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn component(&self, kind: &str) -> Option<&ComponentSettings> {
        self.components.get(kind)
    }

    /// Kinds are enabled unless the configuration explicitly disables them.
    pub fn is_enabled(&self, kind: &str) -> bool {
        self.component(kind).map_or(true, |c| c.enabled)
    }

    /// Looks up a single factory option for `kind`.
    pub fn option(&self, kind: &str, key: &str) -> Option<&str> {
        self.component(kind)
            .and_then(|c| c.options.get(key))
            .map(String::as_str)
    }
}

// --- Default value functions for serde ---

fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "lifecycled".to_string(),
            token_secret: None,
            logging: LoggingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            shutdown_grace_ms: 5_000,
            components: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            options: BTreeMap::new(),
        }
    }
}
