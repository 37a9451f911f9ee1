//! Device config unification. A plugin may get device config from several
//! files plus the dynamic registrar; before devices are materialized those
//! trees are merged into a single canonical [`DeviceConfig`]. Locations
//! concatenate, device kinds merge by name, and the result is validated as a
//! whole: location names must be unique, racks and boards non-empty, and
//! every instance's location reference must resolve.

use std::collections::HashSet;

use super::version::SchemeVersion;
use super::{ConfigContext, ConfigSource, DeviceConfig, DeviceKindConfig};
use crate::errors::{MultiError, SdkError};

/// Merges an ordered list of device config contexts into one. Merging the
/// same tree again is a no-op, so unification is idempotent.
pub(crate) fn unify(
    contexts: Vec<ConfigContext<DeviceConfig>>,
) -> Result<ConfigContext<DeviceConfig>, SdkError> {
    let mut contexts = contexts.into_iter();
    let first = match contexts.next() {
        Some(ctx) => ctx,
        None => {
            return Ok(ConfigContext::new(
                ConfigSource::Empty,
                DeviceConfig {
                    version: SchemeVersion::current().to_string(),
                    ..Default::default()
                },
            ))
        }
    };

    let source = first.source.clone();
    let base_version = context_version(&first)?;
    let mut unified = first.config;

    for ctx in contexts {
        let version = context_version(&ctx)?;
        if !version.is_equal(&base_version) {
            return Err(SdkError::ValidationError {
                context: ctx.source.to_string(),
                reason: format!(
                    "device config version {} does not match the version {} of the first config",
                    version, base_version
                ),
            });
        }
        merge(&mut unified, ctx.config, &ctx.source)?;
    }

    validate_unified(&unified)?;
    Ok(ConfigContext::new(source, unified))
}

fn context_version(ctx: &ConfigContext<DeviceConfig>) -> Result<SchemeVersion, SdkError> {
    // Dynamic contexts may leave the version unset; they take the current
    // scheme version.
    if ctx.config.version.is_empty() {
        return Ok(SchemeVersion::current());
    }
    SchemeVersion::parse(&ctx.config.version)
}

fn merge(
    unified: &mut DeviceConfig,
    incoming: DeviceConfig,
    source: &ConfigSource,
) -> Result<(), SdkError> {
    unified.locations.extend(incoming.locations);

    for kind in incoming.devices {
        match unified.devices.iter_mut().find(|k| k.name == kind.name) {
            Some(existing) => merge_kind(existing, kind, source)?,
            None => unified.devices.push(kind),
        }
    }
    Ok(())
}

// Merges two configs for the same device kind. Instance lists concatenate;
// any other field must be identical on both sides, or set on only one.
fn merge_kind(
    existing: &mut DeviceKindConfig,
    incoming: DeviceKindConfig,
    source: &ConfigSource,
) -> Result<(), SdkError> {
    let conflict = |field: &str, ours: &str, theirs: &str| SdkError::ValidationError {
        context: source.to_string(),
        reason: format!(
            "device kind '{}' conflicts with an earlier config on '{}' ('{}' vs '{}')",
            existing.name, field, ours, theirs
        ),
    };

    if !incoming.device_type.is_empty() {
        if existing.device_type.is_empty() {
            existing.device_type = incoming.device_type;
        } else if existing.device_type != incoming.device_type {
            return Err(conflict("type", &existing.device_type, &incoming.device_type));
        }
    }
    if !incoming.model.is_empty() {
        if existing.model.is_empty() {
            existing.model = incoming.model;
        } else if existing.model != incoming.model {
            return Err(conflict("model", &existing.model, &incoming.model));
        }
    }
    if !incoming.info.is_empty() {
        if existing.info.is_empty() {
            existing.info = incoming.info;
        } else if existing.info != incoming.info {
            return Err(conflict("info", &existing.info, &incoming.info));
        }
    }
    if !incoming.outputs.is_empty() {
        if existing.outputs.is_empty() {
            existing.outputs = incoming.outputs;
        } else if existing.outputs != incoming.outputs {
            return Err(SdkError::ValidationError {
                context: source.to_string(),
                reason: format!(
                    "device kind '{}' conflicts with an earlier config on 'outputs'",
                    existing.name
                ),
            });
        }
    }

    existing.instances.extend(incoming.instances);
    Ok(())
}

// Whole-tree checks that only make sense after merging.
fn validate_unified(config: &DeviceConfig) -> Result<(), SdkError> {
    let mut errs = MultiError::new();

    let mut seen = HashSet::new();
    for location in &config.locations {
        if location.name.is_empty() {
            errs.push(SdkError::ValidationError {
                context: "device config".to_string(),
                reason: "location name may not be empty".to_string(),
            });
            continue;
        }
        if !seen.insert(location.name.as_str()) {
            errs.push(SdkError::ValidationError {
                context: "device config".to_string(),
                reason: format!("duplicate location name '{}'", location.name),
            });
        }
        if location.rack.is_empty() || location.board.is_empty() {
            errs.push(SdkError::ValidationError {
                context: "device config".to_string(),
                reason: format!(
                    "location '{}' must set both rack and board",
                    location.name
                ),
            });
        }
    }

    let locations: HashSet<&str> = config.locations.iter().map(|l| l.name.as_str()).collect();
    for kind in &config.devices {
        if kind.name.is_empty() {
            errs.push(SdkError::ValidationError {
                context: "device config".to_string(),
                reason: "device kind name may not be empty".to_string(),
            });
        }
        for instance in &kind.instances {
            if !locations.contains(instance.location.as_str()) {
                errs.push(SdkError::ValidationError {
                    context: "device config".to_string(),
                    reason: format!(
                        "instance of kind '{}' references unknown location '{}'",
                        kind.name, instance.location
                    ),
                });
            }
        }
    }

    errs.into_result()
}
