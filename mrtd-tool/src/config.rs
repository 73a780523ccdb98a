use std::collections::HashMap;
use std::path::Path;

use ::config::{Config, ConfigError, Environment, File};
use mrtd_access::session::SessionConfig;
use serde::Deserialize;


/// The name of the configuration file looked up in the working directory if none is given.
const DEFAULT_CONFIG_NAME: &str = "mrtd-tool";


#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ToolConfig {
    pub session: SessionConfig,

    /// The reader to use if none is given on the command line.
    pub reader_index: usize,

    /// The log filter used if `RUST_LOG` is not set.
    pub log_level: String,
}
impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reader_index: 0,
            log_level: "info".to_owned(),
        }
    }
}
impl ToolConfig {
    /// Loads the configuration from the given file (or `mrtd-tool.toml` if present) and the
    /// environment.
    ///
    /// Environment variables have the form `MRTD_SESSION__MAX_READ_LENGTH`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_sources(path, None)
    }

    /// Like [`load`](Self::load), but takes the overrides from `env_vars` instead of the
    /// environment.
    pub fn load_with_sources(path: Option<&Path>, env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            builder = builder.add_source(
                Environment::with_prefix("MRTD")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
