//! Launch configuration.
//!
//! Front-end `launch`/`attach` arguments are applied on top of the `[launch]` table of an
//! optional TOML file, key by key.

use crate::error::Error;
use crate::{muted_error, weak_error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file, relative to the home directory.
const DEFAULT_PATH: &str = ".config/replstalker/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    /// Working directory of the primary process.
    pub cwd: Option<PathBuf>,
    pub primary: Option<ProcessConfig>,
    pub debug_tool: Option<ProcessConfig>,
    /// Port the primary process opens for the debug tool.
    pub debug_port: u16,
    pub repl_host: String,
    /// Port of the debug tool evaluation server.
    pub repl_port: u16,
    /// Port of the embedding host side channel, no side channel if absent.
    pub host_port: Option<u16>,
    /// Project descriptor (relative to the installation directory) copied next to the debug tool.
    pub bootstrap_descriptor: PathBuf,
    /// Environment variable that carries debug flags of the primary process.
    pub debug_flag_var: String,
    /// Value of `debug_flag_var`, `{port}` is replaced with `debug_port`.
    pub debug_flag_template: String,
    pub refresh_on_launch: bool,
    pub stop_on_entry: bool,
    /// Expression evaluated on disconnect to stop the remote runtime.
    pub exit_expression: String,
    /// Remote path prefix to local path prefix.
    pub source_map: BTreeMap<String, String>,
    pub offline: bool,
    /// Program stepped through in offline mode.
    pub program: Option<PathBuf>,
    /// Seconds, no limit if absent.
    pub launch_timeout: Option<u64>,
    pub connect_retry_millis: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cwd: None,
            primary: None,
            debug_tool: None,
            debug_port: 5005,
            repl_host: "127.0.0.1".to_string(),
            repl_port: 7888,
            host_port: None,
            bootstrap_descriptor: PathBuf::from("debug-tool/project.clj"),
            debug_flag_var: "JVM_OPTS".to_string(),
            debug_flag_template:
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address={port}".to_string(),
            refresh_on_launch: false,
            stop_on_entry: false,
            exit_expression: "(System/exit 0)".to_string(),
            source_map: BTreeMap::new(),
            offline: false,
            program: None,
            launch_timeout: None,
            connect_retry_millis: 1000,
        }
    }
}

impl LaunchConfig {
    /// Value of the debug flag environment variable.
    pub fn debug_flag(&self) -> String {
        self.debug_flag_template
            .replace("{port}", &self.debug_port.to_string())
    }

    pub fn repl_addr(&self) -> String {
        format!("{}:{}", self.repl_host, self.repl_port)
    }

    pub fn host_addr(&self) -> Option<String> {
        self.host_port.map(|port| format!("127.0.0.1:{port}"))
    }

    pub fn launch_timeout(&self) -> Option<Duration> {
        self.launch_timeout.map(Duration::from_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachConfig {
    pub host: String,
    pub port: u16,
    /// Debug port of a process the debug tool should attach to.
    pub debug_port: Option<u16>,
    pub host_port: Option<u16>,
    pub refresh_on_launch: bool,
    pub source_map: BTreeMap<String, String>,
    pub connect_retry_millis: u64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7888,
            debug_port: None,
            host_port: None,
            refresh_on_launch: false,
            source_map: BTreeMap::new(),
            connect_retry_millis: 1000,
        }
    }
}

impl AttachConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn host_addr(&self) -> Option<String> {
        self.host_port.map(|port| format!("127.0.0.1:{port}"))
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub launch: toml::Table,
}

impl ConfigFile {
    /// Load configuration file. Missing default file means empty configuration, errors in an
    /// explicitly given file are logged and the file is ignored.
    pub fn from_file(path: Option<&Path>) -> Self {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Self::default();
                };
                match muted_error!(read_to_string(home.join(DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Self::default(),
                }
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("Error while load config file {}: {err}", path.display());
                    return Self::default();
                }
            },
        };

        weak_error!(Self::parse(&data), "config file:").unwrap_or_default()
    }

    pub fn parse(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Build configuration from file defaults and front-end arguments.
    pub fn resolve<T: DeserializeOwned>(&self, arguments: &serde_json::Value) -> Result<T, Error> {
        let mut merged = serde_json::to_value(&self.launch)?;
        if let (Some(base), Some(overlay)) = (merged.as_object_mut(), arguments.as_object()) {
            for (key, value) in overlay {
                // keys of the debug adapter protocol itself are not a part of configuration
                if key.starts_with("__") || value.is_null() {
                    continue;
                }
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(merged)?)
    }
}
