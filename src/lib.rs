//! An SDK for writing Synse plugins in Rust.
//!
//! A plugin is a process that exposes a set of devices (sensors, actuators,
//! meters) to the Synse platform over gRPC. The SDK handles everything other
//! than the device-specific logic: it discovers devices from layered YAML
//! configuration, schedules periodic reads, serializes writes through a
//! bounded queue, tracks asynchronous write transactions, and serves the
//! [`Plugin`] gRPC API on a Unix (or TCP) socket.
//!
//! Plugin authors implement [`DeviceHandler`] for each class of device they
//! support and hand the handlers to a [`PluginBuilder`]:
//!
//! ```no_run
//! use synse_sdk::{Device, DeviceHandler, PluginBuilder, Reading, Value};
//!
//! struct TemperatureHandler;
//!
//! #[async_trait::async_trait]
//! impl DeviceHandler for TemperatureHandler {
//!     fn device_type(&self) -> &str {
//!         "temperature"
//!     }
//!
//!     fn model(&self) -> &str {
//!         "temp2010"
//!     }
//!
//!     fn supports_read(&self) -> bool {
//!         true
//!     }
//!
//!     async fn read(&self, _device: &Device) -> anyhow::Result<Vec<Reading>> {
//!         // Talk to the hardware here.
//!         Ok(vec![Reading::new("temperature", Value::Int16(20))])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     PluginBuilder::new()
//!         .register_handler(TemperatureHandler)
//!         .run()
//!         .await
//! }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod device;
pub mod errors;
pub mod grpc_sock;
pub mod output;
pub mod plugin;
pub mod policy;
pub mod reading;
pub mod transaction;

mod scheduler;
mod server;

/// Generated types for the Synse plugin gRPC API.
pub mod api {
    /// Version 3 of the plugin API.
    pub mod v3 {
        #![allow(missing_docs)]
        tonic::include_proto!("synse.v3");
    }
}

pub use self::device::{Device, DeviceHandler, Location};
pub use self::errors::{MultiError, SdkError};
pub use self::output::{OutputType, Unit};
pub use self::plugin::{Plugin, PluginBuilder};
pub use self::policy::{ConfigPolicies, Policy};
pub use self::reading::{Reading, Value};
pub use self::transaction::{WriteData, WriteState, WriteTransaction};

/// The version of the SDK itself, reported through the Metainfo RPC.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
