//! Config policies. Each config source (the plugin config file, the device
//! config files, the output type config files, and dynamic device config)
//! carries a policy that decides what happens when the source is absent or
//! present. Policies are set on the [`PluginBuilder`](crate::PluginBuilder)
//! before startup.

use tracing::warn;

use crate::errors::SdkError;

/// How the presence or absence of a config source is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The source must be present; absence is a fatal policy violation.
    Required,
    /// The source may be absent, in which case an empty/default context is
    /// silently substituted.
    Optional,
    /// The source is ignored even when present (with a warning). The plugin
    /// must supply the config by other means.
    Prohibited,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Optional
    }
}

/// The set of policies for every config source the SDK knows about.
#[derive(Debug, Clone)]
pub struct ConfigPolicies {
    /// Policy for the plugin config file (`config.yml`).
    pub plugin_config: Policy,
    /// Policy for device config files.
    pub device_config: Policy,
    /// Policy for output type config files.
    pub output_type_config: Policy,
    /// Policy for dynamic device config from the plugin's registrar.
    pub dynamic_config: Policy,
}

impl Default for ConfigPolicies {
    fn default() -> Self {
        ConfigPolicies {
            plugin_config: Policy::Required,
            device_config: Policy::Optional,
            output_type_config: Policy::Optional,
            dynamic_config: Policy::Optional,
        }
    }
}

/// Applies a policy to the result of loading a config source. Only a
/// not-found outcome is negotiable; every other load error short-circuits.
pub(crate) fn apply<T>(
    policy: Policy,
    what: &str,
    loaded: Result<Vec<T>, SdkError>,
) -> Result<Vec<T>, SdkError> {
    match loaded {
        Ok(contexts) => match policy {
            Policy::Prohibited => {
                warn!(
                    source = %what,
                    "config source is prohibited by policy, ignoring it"
                );
                Ok(Vec::new())
            }
            _ => Ok(contexts),
        },
        Err(SdkError::ConfigNotFound(msg)) => match policy {
            Policy::Required => Err(SdkError::PolicyViolation(format!(
                "{} is required by policy but was not found: {}",
                what, msg
            ))),
            Policy::Optional | Policy::Prohibited => Ok(Vec::new()),
        },
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> Result<Vec<u32>, SdkError> {
        Err(SdkError::ConfigNotFound("no files".to_string()))
    }

    #[test]
    fn default_policies() {
        let policies = ConfigPolicies::default();
        assert_eq!(policies.plugin_config, Policy::Required);
        assert_eq!(policies.device_config, Policy::Optional);
        assert_eq!(policies.output_type_config, Policy::Optional);
        assert_eq!(policies.dynamic_config, Policy::Optional);
    }

    #[test]
    fn required_missing_is_violation() {
        match apply(Policy::Required, "plugin config", not_found()) {
            Err(SdkError::PolicyViolation(msg)) => assert!(msg.contains("plugin config")),
            other => panic!("expected PolicyViolation, got {:?}", other),
        }
    }

    #[test]
    fn optional_missing_is_empty() {
        let got = apply(Policy::Optional, "device config", not_found()).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn prohibited_present_is_ignored() {
        let got = apply(Policy::Prohibited, "device config", Ok(vec![1, 2, 3])).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn other_errors_short_circuit() {
        let loaded: Result<Vec<u32>, SdkError> = Err(SdkError::ParseError {
            source_name: "file:bad.yml".to_string(),
            reason: "mapping expected".to_string(),
        });
        match apply(Policy::Optional, "device config", loaded) {
            Err(SdkError::ParseError { .. }) => (),
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn required_present_passes_through() {
        let got = apply(Policy::Required, "plugin config", Ok(vec![7])).unwrap();
        assert_eq!(got, vec![7]);
    }
}
