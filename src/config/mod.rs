//! Configuration for plugins and their devices. Three kinds of config feed a
//! plugin: the plugin config (runtime knobs, one YAML document), device
//! configs (locations and device instances, a directory of YAML documents),
//! and output type configs (a directory of YAML documents). Every document
//! carries a top-level scheme `version`. Each parsed tree is wrapped in a
//! [`ConfigContext`] tagging where it came from, so diagnostics can point at
//! the offending source.

pub mod version;

pub(crate) mod unify;
pub(crate) mod validation;

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::errors::SdkError;
use crate::output::OutputType;

/// Env var overriding where the plugin config file is searched for.
pub const PLUGIN_CONFIG_ENV: &str = "PLUGIN_CONFIG";
/// Env var overriding where device instance configs are searched for.
pub const DEVICE_CONFIG_ENV: &str = "PLUGIN_DEVICE_CONFIG";
/// Env var overriding where legacy prototype configs are searched for.
pub const PROTO_CONFIG_ENV: &str = "PLUGIN_PROTO_CONFIG";
/// Env var overriding where output type configs are searched for.
pub const TYPE_CONFIG_ENV: &str = "PLUGIN_TYPE_CONFIG";

/// Default capacity of the read channel.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 100;
/// Default capacity of the write queue.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 100;
/// Default number of writes processed per scheduler iteration.
pub const DEFAULT_WRITES_PER_LOOP: usize = 5;
/// Default time, in seconds, a completed transaction is tracked for.
pub const DEFAULT_TRANSACTION_TTL: u64 = 300;

const PLUGIN_CONFIG_SEARCH_PATHS: &[&str] = &[".", "./config", "/etc/synse/plugin/config"];
const DEFAULT_DEVICE_CONFIG_DIR: &str = "/etc/synse/plugin/config/device";
const DEFAULT_PROTO_CONFIG_DIR: &str = "/etc/synse/plugin/config/proto";
const DEFAULT_TYPE_CONFIG_DIR: &str = "/etc/synse/plugin/config/type";
const PLUGIN_CONFIG_BASENAMES: &[&str] = &["config.yml", "config.yaml"];
const YAML_EXTENSIONS: &[&str] = &["yml", "yaml"];

/// Where a config tree came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Loaded from a file on disk.
    File(PathBuf),
    /// Produced by the plugin's dynamic registrar.
    Dynamic,
    /// A built-in default.
    Default,
    /// An empty substitute, e.g. for an optional source that was absent.
    Empty,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "file:{}", path.display()),
            ConfigSource::Dynamic => write!(f, "dynamic"),
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Empty => write!(f, "empty"),
        }
    }
}

/// A config tree paired with the source it was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigContext<T> {
    /// Where the config came from.
    pub source: ConfigSource,
    /// The config tree itself.
    pub config: T,
}

impl<T> ConfigContext<T> {
    /// Returns a new context wrapping a config tree.
    pub fn new(source: ConfigSource, config: T) -> Self {
        ConfigContext { source, config }
    }
}

/// The runtime configuration of a plugin, from `config.yml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginConfig {
    /// The version of the plugin, which doubles as the config scheme version
    /// of the document. Required.
    pub version: String,

    /// The name of the plugin. Required.
    pub name: String,

    /// Raises the log level to DEBUG.
    pub debug: bool,

    /// Capacity of the read channel. 0 means the default.
    pub read_buffer_size: usize,

    /// Capacity of the write queue. 0 means the default.
    pub write_buffer_size: usize,

    /// How many queued writes the scheduler processes per iteration. 0 means
    /// the default.
    pub writes_per_loop: usize,

    /// Milliseconds to sleep between scheduler iterations.
    pub loop_delay: u64,

    /// Seconds a terminal transaction is tracked before the reaper removes
    /// it. 0 means the default.
    #[serde(rename = "transactionTTL")]
    pub transaction_ttl: u64,

    /// The socket the plugin serves its gRPC API on.
    pub network: NetworkConfig,

    /// Config handed to the plugin's dynamic device registrar.
    pub dynamic_registration: DynamicRegistrationConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            version: String::new(),
            name: String::new(),
            debug: false,
            read_buffer_size: 0,
            write_buffer_size: 0,
            writes_per_loop: 0,
            loop_delay: 0,
            transaction_ttl: 0,
            network: NetworkConfig::default(),
            dynamic_registration: DynamicRegistrationConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Replaces zero-valued knobs with their defaults.
    pub(crate) fn apply_defaults(&mut self) {
        if self.read_buffer_size == 0 {
            self.read_buffer_size = DEFAULT_READ_BUFFER_SIZE;
        }
        if self.write_buffer_size == 0 {
            self.write_buffer_size = DEFAULT_WRITE_BUFFER_SIZE;
        }
        if self.writes_per_loop == 0 {
            self.writes_per_loop = DEFAULT_WRITES_PER_LOOP;
        }
        if self.transaction_ttl == 0 {
            self.transaction_ttl = DEFAULT_TRANSACTION_TTL;
        }
    }

    /// Semantic checks that cannot be expressed by the scheme: the plugin
    /// name and version must be set.
    pub(crate) fn validate(&self) -> Result<(), SdkError> {
        if self.name.is_empty() {
            return Err(SdkError::ValidationError {
                context: "plugin config".to_string(),
                reason: "'name' may not be empty".to_string(),
            });
        }
        if self.version.is_empty() {
            return Err(SdkError::ValidationError {
                context: "plugin config".to_string(),
                reason: "'version' may not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// How the plugin listens for gRPC requests.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    /// The kind of socket to serve on.
    #[serde(rename = "type")]
    pub protocol: NetworkProtocol,

    /// The address to serve on: a socket path for `unix`, a `host:port` for
    /// `tcp`. When empty, a Unix socket path is derived from the plugin
    /// name.
    pub address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            protocol: NetworkProtocol::Unix,
            address: String::new(),
        }
    }
}

/// The supported socket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    /// A Unix domain socket. The preferred transport.
    Unix,
    /// A TCP socket.
    Tcp,
}

/// Opaque config blocks handed to the plugin's dynamic device registrar.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DynamicRegistrationConfig {
    /// One opaque map per dynamic source.
    #[serde(default)]
    pub config: Vec<HashMap<String, serde_yaml::Value>>,
}

/// A device config tree: named locations plus device kinds holding
/// instances. Multiple trees (one per file, plus dynamic ones) are unified
/// into a single tree before devices are materialized.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// The config scheme version of the document.
    pub version: String,
    /// The locations devices may reference.
    pub locations: Vec<LocationConfig>,
    /// The device kinds, each holding device instances.
    pub devices: Vec<DeviceKindConfig>,
}

/// A named rack/board pair that device instances reference.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// The name instances use to reference this location.
    pub name: String,
    /// The rack identifier.
    pub rack: String,
    /// The board identifier.
    pub board: String,
}

/// A group of device instances sharing a type and model.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceKindConfig {
    /// The (possibly dotted) name of the kind, e.g. "temperature".
    pub name: String,

    /// The device type. When empty, the last dot-segment of the kind name is
    /// used.
    #[serde(rename = "type")]
    pub device_type: String,

    /// The device model, matched against registered handlers.
    pub model: String,

    /// A human-readable description of the kind.
    pub info: String,

    /// Output types every instance of this kind produces.
    pub outputs: Vec<DeviceOutputConfig>,

    /// The configured instances of this kind.
    pub instances: Vec<DeviceInstanceConfig>,
}

impl DeviceKindConfig {
    /// The effective device type: the explicit `type` field, or the last
    /// dot-segment of the kind name.
    pub fn resolved_type(&self) -> &str {
        if self.device_type.is_empty() {
            self.name.rsplit('.').next().unwrap_or(&self.name)
        } else {
            &self.device_type
        }
    }
}

/// A single configured device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceInstanceConfig {
    /// A human-readable description of the instance.
    pub info: String,

    /// The name of the location this instance lives at. Must resolve against
    /// the unified locations list.
    pub location: String,

    /// Protocol-specific opaque data, e.g. an address or serial number.
    pub data: HashMap<String, String>,

    /// Output types this instance produces, in addition to any kind-level
    /// outputs.
    pub outputs: Vec<DeviceOutputConfig>,
}

/// A reference to an output type from device config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceOutputConfig {
    /// The name of the referenced output type.
    #[serde(rename = "type")]
    pub output_type: String,

    /// A human-readable description of this output.
    pub info: String,
}

/// An output type document: a scheme version plus the output type itself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputTypeConfig {
    /// The config scheme version of the document.
    pub version: String,

    /// The output type the document defines.
    #[serde(flatten)]
    pub output: OutputType,
}

/// Converts a raw-YAML context into a typed one.
pub(crate) fn from_value<T: DeserializeOwned>(
    ctx: ConfigContext<serde_yaml::Value>,
) -> Result<ConfigContext<T>, SdkError> {
    let source = ctx.source.clone();
    let config = serde_yaml::from_value(ctx.config).map_err(|err| SdkError::ParseError {
        source_name: source.to_string(),
        reason: err.to_string(),
    })?;
    Ok(ConfigContext::new(source, config))
}

/// Finds and loads the plugin config document. The `PLUGIN_CONFIG` env var
/// overrides the built-in search path, pointing either at the document
/// itself or at a directory holding `config.{yml,yaml}`.
pub(crate) fn load_plugin_config() -> Result<ConfigContext<serde_yaml::Value>, SdkError> {
    let path = find_plugin_config(env::var(PLUGIN_CONFIG_ENV).ok())?;
    debug!(path = %path.display(), "loading plugin config");
    load_yaml_file(&path)
}

pub(crate) fn find_plugin_config(env_override: Option<String>) -> Result<PathBuf, SdkError> {
    let candidates: Vec<PathBuf> = match env_override {
        Some(path) => vec![PathBuf::from(path)],
        None => PLUGIN_CONFIG_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
    };
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
        for basename in PLUGIN_CONFIG_BASENAMES {
            let path = candidate.join(basename);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    Err(SdkError::ConfigNotFound(format!(
        "no plugin config found under: {}",
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

/// Loads every device config document: instance configs from the device
/// config directory plus legacy prototype fragments from the proto config
/// directory. The `PLUGIN_DEVICE_CONFIG` and `PLUGIN_PROTO_CONFIG` env vars
/// override the built-in directories.
pub(crate) fn load_device_configs() -> Result<Vec<ConfigContext<serde_yaml::Value>>, SdkError> {
    let device_dir = env::var(DEVICE_CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DEVICE_CONFIG_DIR));
    let proto_dir = env::var(PROTO_CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROTO_CONFIG_DIR));
    load_device_configs_from(&device_dir, &proto_dir)
}

pub(crate) fn load_device_configs_from(
    device_dir: &Path,
    proto_dir: &Path,
) -> Result<Vec<ConfigContext<serde_yaml::Value>>, SdkError> {
    let mut contexts = read_config_dir(&resolve_collection_dir(device_dir, "device"))?;
    contexts.extend(read_config_dir(&resolve_collection_dir(proto_dir, "proto"))?);
    if contexts.is_empty() {
        return Err(SdkError::ConfigNotFound(format!(
            "no device configs found under {} or {}",
            device_dir.display(),
            proto_dir.display()
        )));
    }
    Ok(contexts)
}

/// Loads every output type config document. The `PLUGIN_TYPE_CONFIG` env var
/// overrides the built-in directory.
pub(crate) fn load_output_type_configs() -> Result<Vec<ConfigContext<serde_yaml::Value>>, SdkError>
{
    let dir = env::var(TYPE_CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_TYPE_CONFIG_DIR));
    load_output_type_configs_from(&dir)
}

pub(crate) fn load_output_type_configs_from(
    dir: &Path,
) -> Result<Vec<ConfigContext<serde_yaml::Value>>, SdkError> {
    let contexts = read_config_dir(&resolve_collection_dir(dir, "type"))?;
    if contexts.is_empty() {
        return Err(SdkError::ConfigNotFound(format!(
            "no output type configs found under {}",
            dir.display()
        )));
    }
    Ok(contexts)
}

// A collection dir may either hold config files directly or hold them in a
// conventionally-named subdirectory.
fn resolve_collection_dir(base: &Path, subdir: &str) -> PathBuf {
    let nested = base.join(subdir);
    if nested.is_dir() {
        nested
    } else {
        base.to_path_buf()
    }
}

// Reads and parses every YAML file directly under the given directory, in
// file name order. A missing directory yields an empty list; the caller
// decides whether that amounts to not-found.
fn read_config_dir(dir: &Path) -> Result<Vec<ConfigContext<serde_yaml::Value>>, SdkError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| YAML_EXTENSIONS.contains(&ext))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut contexts = Vec::with_capacity(paths.len());
    for path in paths {
        debug!(path = %path.display(), "loading config file");
        contexts.push(load_yaml_file(&path)?);
    }
    Ok(contexts)
}

fn load_yaml_file(path: &Path) -> Result<ConfigContext<serde_yaml::Value>, SdkError> {
    let source = ConfigSource::File(path.to_path_buf());
    let raw = fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            SdkError::ConfigNotFound(format!("{}", path.display()))
        }
        _ => SdkError::Io(err),
    })?;
    let config: serde_yaml::Value =
        serde_yaml::from_slice(&raw).map_err(|err| SdkError::ParseError {
            source_name: source.to_string(),
            reason: err.to_string(),
        })?;
    Ok(ConfigContext::new(source, config))
}
