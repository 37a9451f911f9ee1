//! The device model. A [`Device`] is the runtime object materialized from
//! unified device config: it pairs the configured instance with the
//! registered [`DeviceHandler`] for its `(type, model)` and carries a stable
//! ID derived from the device's location, kind, model, and protocol
//! identity. The registry of devices is immutable once the plugin is built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::api::v3 as api;
use crate::config::DeviceConfig;
use crate::errors::{MultiError, SdkError};
use crate::output::Outputs;
use crate::reading::Reading;
use crate::transaction::WriteData;

// Joins the components hashed into a device ID so that adjacent components
// cannot run together.
const ID_SEPARATOR: u8 = 0x1f;

/// Extracts, from a device's opaque `data` map, whichever fields uniquely
/// identify the physical device under the plugin's protocol (a serial
/// number, a bus address, ...). The output feeds the device ID hash, so it
/// must be deterministic.
pub type DeviceIdentifier = dyn Fn(&HashMap<String, String>) -> String + Send + Sync;

/// Where a device physically lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// The rack identifier. Never empty.
    pub rack: String,
    /// The board identifier. Never empty.
    pub board: String,
}

/// A single device exposed by a plugin.
#[derive(Clone)]
pub struct Device {
    /// The stable, unique ID of the device.
    pub id: String,
    /// The name of the device kind, e.g. "temperature".
    pub kind: String,
    /// The device type, matched against handlers.
    pub device_type: String,
    /// The device model, matched against handlers.
    pub model: String,
    /// A human-readable description.
    pub info: String,
    /// Protocol-specific opaque data from config.
    pub data: HashMap<String, String>,
    /// Where the device lives.
    pub location: Location,
    /// Arena indices of the output types the device produces.
    pub outputs: Vec<usize>,

    pub(crate) handler: Arc<dyn DeviceHandler>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_type", &self.device_type)
            .field("model", &self.model)
            .field("info", &self.info)
            .field("data", &self.data)
            .field("location", &self.location)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Device {
    /// The wire representation of the device, for registry enumeration.
    pub(crate) fn to_rpc(&self, outputs: &Outputs) -> api::DeviceSummary {
        api::DeviceSummary {
            id: self.id.clone(),
            kind: self.kind.clone(),
            r#type: self.device_type.clone(),
            model: self.model.clone(),
            info: self.info.clone(),
            location: Some(api::Location {
                rack: self.location.rack.clone(),
                board: self.location.board.clone(),
            }),
            data: self.data.clone(),
            outputs: self
                .outputs
                .iter()
                .filter_map(|idx| outputs.by_index(*idx))
                .map(|output| output.name.clone())
                .collect(),
        }
    }
}

/// The code that knows how to read from and write to one class of devices,
/// keyed by `(type, model)`. At most one handler may be registered per pair.
///
/// A handler that will ever be polled must support `read` or `bulk_read`;
/// one that accepts writes must support `write`. The scheduler invokes all
/// handler methods serially, so a handler never races itself across devices.
/// Handlers performing I/O are expected to enforce their own timeouts; a
/// call that never returns stalls the scheduler.
#[async_trait::async_trait]
pub trait DeviceHandler: Send + Sync + 'static {
    /// The device type this handler serves.
    fn device_type(&self) -> &str;

    /// The device model this handler serves.
    fn model(&self) -> &str;

    /// Whether the handler supports single-device reads.
    fn supports_read(&self) -> bool {
        false
    }

    /// Whether the handler supports bulk reads. When both bulk and
    /// single-device reads are supported, the scheduler prefers bulk.
    fn supports_bulk_read(&self) -> bool {
        false
    }

    /// Whether the handler supports writes.
    fn supports_write(&self) -> bool {
        false
    }

    /// Reads from a single device.
    async fn read(&self, device: &Device) -> anyhow::Result<Vec<Reading>> {
        Err(anyhow::anyhow!(
            "reading is not supported for device {}",
            device.id
        ))
    }

    /// Reads from every given device in one pass, returning readings keyed
    /// by device ID. Useful when one protocol transaction covers a whole
    /// bus.
    async fn bulk_read(
        &self,
        _devices: &[Arc<Device>],
    ) -> anyhow::Result<HashMap<String, Vec<Reading>>> {
        Err(anyhow::anyhow!(
            "bulk reading is not supported by the {}/{} handler",
            self.device_type(),
            self.model()
        ))
    }

    /// Writes to a single device.
    async fn write(&self, device: &Device, _data: &WriteData) -> anyhow::Result<()> {
        Err(anyhow::anyhow!(
            "writing is not supported for device {}",
            device.id
        ))
    }
}

impl fmt::Debug for dyn DeviceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("device_type", &self.device_type())
            .field("model", &self.model())
            .finish()
    }
}

/// The default protocol identifier: every data field, sorted by key, joined
/// as `key=value`. Plugins whose `data` maps contain non-identifying fields
/// should supply their own identifier.
pub fn default_identifier(data: &HashMap<String, String>) -> String {
    let mut fields: Vec<(&String, &String)> = data.iter().collect();
    fields.sort();
    fields
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Derives the stable device ID: the hex SHA-256 of rack, board, kind,
/// model, and the protocol identifier output, in that order, separated so
/// components cannot run together. Stable across restarts as long as config
/// and the identifier function are stable.
pub(crate) fn device_id(
    location: &Location,
    kind: &str,
    model: &str,
    component: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in &[
        location.rack.as_str(),
        location.board.as_str(),
        kind,
        model,
        component,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([ID_SEPARATOR]);
    }
    format!("{:x}", hasher.finalize())
}

/// Builds the handler lookup map, rejecting duplicate `(type, model)`
/// registrations.
pub(crate) fn handler_map(
    handlers: Vec<Arc<dyn DeviceHandler>>,
) -> Result<HashMap<(String, String), Arc<dyn DeviceHandler>>, SdkError> {
    let mut map = HashMap::new();
    for handler in handlers {
        let key = (
            handler.device_type().to_string(),
            handler.model().to_string(),
        );
        if map.contains_key(&key) {
            return Err(SdkError::ValidationError {
                context: "device handlers".to_string(),
                reason: format!(
                    "a handler for type '{}' model '{}' is already registered",
                    key.0, key.1
                ),
            });
        }
        map.insert(key, handler);
    }
    Ok(map)
}

/// Materializes the device registry from unified device config. Every
/// instance must resolve to a registered handler and to known output types,
/// and the derived IDs must be unique.
pub(crate) fn make_devices(
    config: &DeviceConfig,
    handlers: &HashMap<(String, String), Arc<dyn DeviceHandler>>,
    outputs: &Outputs,
    identifier: &Arc<DeviceIdentifier>,
) -> Result<HashMap<String, Arc<Device>>, SdkError> {
    let locations: HashMap<&str, Location> = config
        .locations
        .iter()
        .map(|l| {
            (
                l.name.as_str(),
                Location {
                    rack: l.rack.clone(),
                    board: l.board.clone(),
                },
            )
        })
        .collect();

    let mut errs = MultiError::new();
    let mut devices = HashMap::new();

    for kind in &config.devices {
        let device_type = kind.resolved_type().to_string();
        let handler = match handlers.get(&(device_type.clone(), kind.model.clone())) {
            Some(handler) => handler,
            None => {
                errs.push(SdkError::ValidationError {
                    context: format!("device kind '{}'", kind.name),
                    reason: format!(
                        "no handler registered for type '{}' model '{}'",
                        device_type, kind.model
                    ),
                });
                continue;
            }
        };

        for instance in &kind.instances {
            // Unification already checked that the reference resolves.
            let location = match locations.get(instance.location.as_str()) {
                Some(location) => location.clone(),
                None => {
                    errs.push(SdkError::ValidationError {
                        context: format!("device kind '{}'", kind.name),
                        reason: format!("unknown location '{}'", instance.location),
                    });
                    continue;
                }
            };

            let mut output_indices = Vec::new();
            for output in kind.outputs.iter().chain(instance.outputs.iter()) {
                match outputs.index_of(&output.output_type) {
                    Some(idx) => {
                        if !output_indices.contains(&idx) {
                            output_indices.push(idx);
                        }
                    }
                    None => errs.push(SdkError::ValidationError {
                        context: format!("device kind '{}'", kind.name),
                        reason: format!("unknown output type '{}'", output.output_type),
                    }),
                }
            }

            let component = (**identifier)(&instance.data);
            let id = device_id(&location, &kind.name, &kind.model, &component);
            let device = Device {
                id: id.clone(),
                kind: kind.name.clone(),
                device_type: device_type.clone(),
                model: kind.model.clone(),
                info: instance.info.clone(),
                data: instance.data.clone(),
                location,
                outputs: output_indices,
                handler: handler.clone(),
            };
            if devices.insert(id.clone(), Arc::new(device)).is_some() {
                errs.push(SdkError::ValidationError {
                    context: format!("device kind '{}'", kind.name),
                    reason: format!(
                        "duplicate device ID '{}'; two instances share a location and identity",
                        id
                    ),
                });
            }
        }
    }

    errs.into_result()?;
    Ok(devices)
}
