//! The plugin builder and runtime. A [`PluginBuilder`] accumulates handler
//! and output type registrations, config policies, and plugin-supplied
//! callbacks; [`PluginBuilder::build`] runs the whole configuration pipeline
//! (load, policy, scheme validation, unification, semantic validation) and
//! materializes the immutable device registry. The resulting [`Plugin`]
//! handle runs the long-lived tasks: the gRPC server, the read/write
//! scheduler, the reading cache updater, and the transaction reaper, all
//! wired together with bounded channels and stopped by a shared shutdown
//! signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::api::v3::plugin_server::PluginServer;
use crate::cache::ReadingCache;
use crate::config::{
    self, ConfigContext, ConfigSource, DeviceConfig, NetworkProtocol, OutputTypeConfig,
    PluginConfig,
};
use crate::config::{unify, validation};
use crate::device::{
    self, default_identifier, Device, DeviceHandler, DeviceIdentifier,
};
use crate::errors::SdkError;
use crate::grpc_sock;
use crate::output::{OutputType, Outputs};
use crate::policy::{self, ConfigPolicies, Policy};
use crate::scheduler::Scheduler;
use crate::server::{PluginMeta, PluginService};
use crate::transaction::TransactionTracker;

const DEFAULT_SOCKET_DIR: &str = "/tmp/synse/procs";

/// Produces device config trees for devices that cannot be enumerated ahead
/// of time. Receives the opaque `dynamicRegistration.config` blocks from the
/// plugin config.
pub type DynamicRegistrar = dyn Fn(&[HashMap<String, serde_yaml::Value>]) -> anyhow::Result<Vec<DeviceConfig>>
    + Send
    + Sync;

/// A plugin-supplied semantic check on the loaded plugin config.
pub type PluginConfigValidator = dyn Fn(&PluginConfig) -> anyhow::Result<()> + Send + Sync;

/// A plugin-supplied semantic check on the unified device config.
pub type DeviceConfigValidator = dyn Fn(&DeviceConfig) -> anyhow::Result<()> + Send + Sync;

/// Accumulates everything a plugin registers before startup, then builds the
/// immutable [`Plugin`] runtime.
pub struct PluginBuilder {
    description: String,
    maintainer: String,
    handlers: Vec<Arc<dyn DeviceHandler>>,
    output_types: Vec<OutputType>,
    policies: ConfigPolicies,
    identifier: Arc<DeviceIdentifier>,
    plugin_config: Option<PluginConfig>,
    dynamic_registrar: Option<Arc<DynamicRegistrar>>,
    plugin_config_validator: Option<Arc<PluginConfigValidator>>,
    device_config_validator: Option<Arc<DeviceConfigValidator>>,
}

impl Default for PluginBuilder {
    fn default() -> Self {
        PluginBuilder {
            description: String::new(),
            maintainer: String::new(),
            handlers: Vec::new(),
            output_types: Vec::new(),
            policies: ConfigPolicies::default(),
            identifier: Arc::new(default_identifier),
            plugin_config: None,
            dynamic_registrar: None,
            plugin_config_validator: None,
            device_config_validator: None,
        }
    }
}

impl PluginBuilder {
    /// Returns a new builder with default policies.
    pub fn new() -> Self {
        PluginBuilder::default()
    }

    /// Sets the plugin description reported through Metainfo.
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Sets the plugin maintainer reported through Metainfo.
    pub fn maintainer(mut self, maintainer: &str) -> Self {
        self.maintainer = maintainer.to_string();
        self
    }

    /// Registers a device handler. At most one handler may be registered per
    /// `(type, model)` pair; duplicates fail at build time.
    pub fn register_handler<H: DeviceHandler>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Registers an output type from code, e.g. when output type config
    /// files are prohibited.
    pub fn register_output_type(mut self, output: OutputType) -> Self {
        self.output_types.push(output);
        self
    }

    /// Supplies the plugin config from code instead of (or as a fallback
    /// for) the plugin config file.
    pub fn plugin_config(mut self, config: PluginConfig) -> Self {
        self.plugin_config = Some(config);
        self
    }

    /// Replaces all config policies at once.
    pub fn policies(mut self, policies: ConfigPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Sets the policy for the plugin config file.
    pub fn plugin_config_policy(mut self, policy: Policy) -> Self {
        self.policies.plugin_config = policy;
        self
    }

    /// Sets the policy for device config files.
    pub fn device_config_policy(mut self, policy: Policy) -> Self {
        self.policies.device_config = policy;
        self
    }

    /// Sets the policy for output type config files.
    pub fn output_type_config_policy(mut self, policy: Policy) -> Self {
        self.policies.output_type_config = policy;
        self
    }

    /// Sets the policy for dynamic device config.
    pub fn dynamic_config_policy(mut self, policy: Policy) -> Self {
        self.policies.dynamic_config = policy;
        self
    }

    /// Sets the protocol identifier used to derive stable device IDs. The
    /// default uses every field of a device's `data` map.
    pub fn device_identifier<F>(mut self, identifier: F) -> Self
    where
        F: Fn(&HashMap<String, String>) -> String + Send + Sync + 'static,
    {
        self.identifier = Arc::new(identifier);
        self
    }

    /// Sets the dynamic device registrar.
    pub fn dynamic_registrar<F>(mut self, registrar: F) -> Self
    where
        F: Fn(&[HashMap<String, serde_yaml::Value>]) -> anyhow::Result<Vec<DeviceConfig>>
            + Send
            + Sync
            + 'static,
    {
        self.dynamic_registrar = Some(Arc::new(registrar));
        self
    }

    /// Sets a semantic validator for the plugin config.
    pub fn plugin_config_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PluginConfig) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.plugin_config_validator = Some(Arc::new(validator));
        self
    }

    /// Sets a semantic validator for the unified device config.
    pub fn device_config_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&DeviceConfig) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.device_config_validator = Some(Arc::new(validator));
        self
    }

    /// Runs the configuration pipeline and materializes the device registry,
    /// returning the immutable plugin runtime. Nothing is served yet; use
    /// [`Plugin::run`] for that.
    pub fn build(self) -> Result<Plugin, SdkError> {
        let PluginBuilder {
            description,
            maintainer,
            handlers,
            output_types,
            policies,
            identifier,
            plugin_config,
            dynamic_registrar,
            plugin_config_validator,
            device_config_validator,
        } = self;

        let config = build_plugin_config(
            policies.plugin_config,
            plugin_config,
            plugin_config_validator.as_deref(),
        )?;

        let outputs = build_outputs(policies.output_type_config, output_types)?;

        let device_config = build_device_config(
            &policies,
            &config,
            dynamic_registrar.as_deref(),
            device_config_validator.as_deref(),
        )?;

        let handlers = device::handler_map(handlers)?;
        let devices = device::make_devices(&device_config.config, &handlers, &outputs, &identifier)?;
        if devices.is_empty() {
            warn!("no devices were configured for this plugin");
        }
        info!(
            plugin = %config.name,
            devices = %devices.len(),
            outputs = %outputs.len(),
            "plugin built"
        );

        let meta = PluginMeta {
            name: config.name.clone(),
            version: config.version.clone(),
            description,
            maintainer,
        };
        Ok(Plugin {
            config,
            devices: Arc::new(devices),
            outputs: Arc::new(outputs),
            meta,
        })
    }

    /// Parses command line flags, initializes logging, builds the plugin,
    /// and serves it. This is the whole `main` of a typical plugin binary.
    #[cfg(feature = "cli")]
    pub async fn run(self) -> anyhow::Result<()> {
        use structopt::StructOpt;

        let opts = Opts::from_args();
        if opts.version {
            println!("synse plugin sdk {}", crate::SDK_VERSION);
            return Ok(());
        }

        let raise_log_level = init_logging(opts.debug);
        let plugin = self.build()?;
        if plugin.config.debug && !opts.debug {
            raise_log_level();
        }
        if opts.dry_run {
            info!(plugin = %plugin.config.name, "dry run: configuration is valid");
            return Ok(());
        }
        plugin.run().await
    }
}

/// Command line options every plugin binary accepts.
#[cfg(feature = "cli")]
#[derive(Debug, structopt::StructOpt)]
#[structopt(
    name = "plugin",
    about = "A Synse plugin",
    setting = structopt::clap::AppSettings::DisableVersion
)]
pub struct Opts {
    /// Raise the log level to DEBUG
    #[structopt(long = "debug")]
    pub debug: bool,

    /// Print version metadata and exit
    #[structopt(long = "version")]
    pub version: bool,

    /// Load and validate configuration, then exit without serving
    #[structopt(long = "dry-run")]
    pub dry_run: bool,
}

// Initializes the global tracing subscriber, honoring RUST_LOG when set.
// Returns a closure that raises the level to DEBUG, for when the plugin
// config asks for it after logging is already up.
#[cfg(feature = "cli")]
fn init_logging(debug: bool) -> impl FnOnce() {
    use tracing_subscriber::filter::EnvFilter;

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_filter_reloading();
    let handle = builder.reload_handle();
    builder.init();

    move || {
        if let Err(err) = handle.reload(EnvFilter::new("debug")) {
            warn!(error = %err, "unable to raise log level to debug");
        }
    }
}

// Stage one of the pipeline: the plugin config. Code-supplied config stands
// in when the file is absent or prohibited.
fn build_plugin_config(
    file_policy: Policy,
    code_config: Option<PluginConfig>,
    validator: Option<&PluginConfigValidator>,
) -> Result<PluginConfig, SdkError> {
    let loaded = config::load_plugin_config().map(|ctx| vec![ctx]);
    let contexts = policy::apply(file_policy, "the plugin config file", loaded)?;

    let mut plugin_config = match contexts.into_iter().next() {
        Some(ctx) => {
            validation::validate(&ctx, validation::PLUGIN_CONFIG_RULES)?;
            config::from_value::<PluginConfig>(ctx)?.config
        }
        None => match code_config {
            Some(config) => config,
            None => PluginConfig::default(),
        },
    };

    if let Some(validator) = validator {
        validator(&plugin_config).map_err(|err| SdkError::ValidationError {
            context: "plugin config".to_string(),
            reason: err.to_string(),
        })?;
    }

    plugin_config.apply_defaults();
    plugin_config.validate()?;
    if plugin_config.network.protocol == NetworkProtocol::Tcp
        && plugin_config.network.address.is_empty()
    {
        return Err(SdkError::ValidationError {
            context: "plugin config".to_string(),
            reason: "a tcp network requires an address".to_string(),
        });
    }
    Ok(plugin_config)
}

// Stage two: output types, from code registrations plus config files.
fn build_outputs(
    file_policy: Policy,
    registered: Vec<OutputType>,
) -> Result<Outputs, SdkError> {
    let mut outputs = Outputs::new();
    for output in registered {
        outputs.register(output)?;
    }

    let contexts = policy::apply(
        file_policy,
        "output type config",
        config::load_output_type_configs(),
    )?;
    for ctx in contexts {
        validation::validate(&ctx, validation::OUTPUT_TYPE_RULES)?;
        let typed = config::from_value::<OutputTypeConfig>(ctx)?;
        outputs.register(typed.config.output)?;
    }
    Ok(outputs)
}

// Stage three: device config from files and the dynamic registrar, unified
// into one tree.
fn build_device_config(
    policies: &ConfigPolicies,
    plugin_config: &PluginConfig,
    registrar: Option<&DynamicRegistrar>,
    validator: Option<&DeviceConfigValidator>,
) -> Result<ConfigContext<DeviceConfig>, SdkError> {
    let contexts = policy::apply(
        policies.device_config,
        "device config",
        config::load_device_configs(),
    )?;

    let mut typed = Vec::with_capacity(contexts.len());
    for ctx in contexts {
        validation::validate(&ctx, validation::DEVICE_CONFIG_RULES)?;
        typed.push(config::from_value::<DeviceConfig>(ctx)?);
    }

    match (registrar, policies.dynamic_config) {
        (Some(_), Policy::Prohibited) => {
            warn!("dynamic device config is prohibited by policy, ignoring the registrar");
        }
        (Some(registrar), dynamic_policy) => {
            let configs = registrar(&plugin_config.dynamic_registration.config).map_err(|err| {
                SdkError::ValidationError {
                    context: "dynamic registration".to_string(),
                    reason: err.to_string(),
                }
            })?;
            if configs.is_empty() && dynamic_policy == Policy::Required {
                return Err(SdkError::PolicyViolation(
                    "dynamic device config is required by policy but the registrar produced none"
                        .to_string(),
                ));
            }
            debug!(count = %configs.len(), "dynamic registrar produced device configs");
            typed.extend(
                configs
                    .into_iter()
                    .map(|config| ConfigContext::new(ConfigSource::Dynamic, config)),
            );
        }
        (None, Policy::Required) => {
            return Err(SdkError::PolicyViolation(
                "dynamic device config is required by policy but no registrar is set".to_string(),
            ));
        }
        (None, _) => (),
    }

    let unified = unify::unify(typed)?;
    if let Some(validator) = validator {
        validator(&unified.config).map_err(|err| SdkError::ValidationError {
            context: "device config".to_string(),
            reason: err.to_string(),
        })?;
    }
    Ok(unified)
}

/// The immutable runtime of a built plugin.
#[derive(Debug)]
pub struct Plugin {
    config: PluginConfig,
    devices: Arc<HashMap<String, Arc<Device>>>,
    outputs: Arc<Outputs>,
    meta: PluginMeta,
}

impl Plugin {
    /// Returns a new builder.
    pub fn builder() -> PluginBuilder {
        PluginBuilder::new()
    }

    /// The loaded plugin config, with defaults applied.
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Looks up a device by ID.
    pub fn device(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.get(id)
    }

    /// Iterates over every registered device.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    /// Serves the plugin until SIGINT or SIGTERM: starts the scheduler, the
    /// reading cache updater, and the transaction reaper, then serves the
    /// gRPC API on the configured socket. Shutdown is cooperative; in-flight
    /// handler calls are not interrupted.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (write_tx, write_rx) = mpsc::channel(self.config.write_buffer_size);
        let (read_tx, read_rx) = mpsc::channel(self.config.read_buffer_size);

        let cache = ReadingCache::new();
        let tracker = TransactionTracker::new(Duration::from_secs(self.config.transaction_ttl));

        tokio::spawn(cache.clone().run_updater(read_rx));
        tokio::spawn(tracker.clone().run_reaper(shutdown_rx.clone()));

        let scheduler = Scheduler {
            devices: self.devices.clone(),
            outputs: self.outputs.clone(),
            tracker: tracker.clone(),
            write_rx,
            read_tx,
            writes_per_loop: self.config.writes_per_loop,
            loop_delay: Duration::from_millis(self.config.loop_delay),
        };
        tokio::spawn(scheduler.run(shutdown_rx.clone()));

        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        let service = PluginService {
            devices: self.devices.clone(),
            outputs: self.outputs.clone(),
            cache,
            tracker,
            write_tx,
            meta: self.meta.clone(),
        };
        let router = Server::builder().add_service(PluginServer::new(service));

        let mut shutdown = shutdown_rx;
        let shutdown_signal = async move {
            // A closed channel also means shutdown.
            let _ = shutdown.changed().await;
        };

        match self.config.network.protocol {
            NetworkProtocol::Unix => {
                let path = if self.config.network.address.is_empty() {
                    PathBuf::from(DEFAULT_SOCKET_DIR)
                        .join(format!("{}.sock", self.config.name))
                } else {
                    PathBuf::from(&self.config.network.address)
                };
                let socket = grpc_sock::server::PluginSocket::bind(&path).await?;
                info!(plugin = %self.config.name, socket = %path.display(), "serving plugin API");
                router
                    .serve_with_incoming_shutdown(socket, shutdown_signal)
                    .await?;
            }
            NetworkProtocol::Tcp => {
                let addr = self.config.network.address.parse()?;
                info!(plugin = %self.config.name, address = %addr, "serving plugin API");
                router.serve_with_shutdown(addr, shutdown_signal).await?;
            }
        }

        info!(plugin = %self.config.name, "plugin stopped");
        Ok(())
    }
}

// Resolves when SIGINT or SIGTERM arrives.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => (),
                _ = term.recv() => (),
            }
        }
        Err(err) => {
            error!(error = %err, "unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
