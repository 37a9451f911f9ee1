//! Config scheme validation. Each config kind has a table of field rules,
//! optionally annotated with the scheme versions a field was added in,
//! deprecated in, or removed in. Validation walks the raw YAML tree against
//! the table, gating each present field on the version the document
//! declares, and aggregates every violation into one error.

use serde_yaml::Value;
use tracing::warn;

use super::version::{SchemeVersion, SCHEME_MAJOR};
use super::ConfigContext;
use crate::errors::{MultiError, SdkError};

/// A rule for one field of a config scheme.
pub(crate) struct FieldRule {
    /// The field name, as it appears in YAML.
    pub name: &'static str,
    /// The scheme version the field first appeared in.
    pub added_in: Option<SchemeVersion>,
    /// The scheme version the field was deprecated in. Use warns.
    pub deprecated_in: Option<SchemeVersion>,
    /// The scheme version the field was removed in. Use fails.
    pub removed_in: Option<SchemeVersion>,
    /// Rules for nested fields, when the field holds a mapping or a
    /// sequence of mappings.
    pub children: &'static [FieldRule],
}

const fn field(name: &'static str) -> FieldRule {
    FieldRule {
        name,
        added_in: None,
        deprecated_in: None,
        removed_in: None,
        children: &[],
    }
}

const fn nested(name: &'static str, children: &'static [FieldRule]) -> FieldRule {
    FieldRule {
        name,
        added_in: None,
        deprecated_in: None,
        removed_in: None,
        children,
    }
}

const fn deprecated(name: &'static str, version: SchemeVersion) -> FieldRule {
    FieldRule {
        name,
        added_in: None,
        deprecated_in: Some(version),
        removed_in: None,
        children: &[],
    }
}

const fn removed(name: &'static str, version: SchemeVersion) -> FieldRule {
    FieldRule {
        name,
        added_in: None,
        deprecated_in: None,
        removed_in: Some(version),
        children: &[],
    }
}

const OUTPUT_REF_RULES: &[FieldRule] = &[field("type"), field("info")];

/// The scheme of the plugin config document.
pub(crate) const PLUGIN_CONFIG_RULES: &[FieldRule] = &[
    field("version"),
    field("name"),
    field("debug"),
    field("readBufferSize"),
    field("writeBufferSize"),
    field("writesPerLoop"),
    field("loopDelay"),
    field("transactionTTL"),
    nested("network", &[field("type"), field("address")]),
    nested("dynamicRegistration", &[field("config")]),
    // Held over from the v0 scheme. Enumeration is always on now.
    deprecated("autoEnumerate", SchemeVersion::new(1, 0)),
    // The v0 socket block was replaced by `network`.
    removed("socket", SchemeVersion::new(1, 0)),
];

/// The scheme of device config documents.
pub(crate) const DEVICE_CONFIG_RULES: &[FieldRule] = &[
    field("version"),
    nested("locations", &[field("name"), field("rack"), field("board")]),
    nested(
        "devices",
        &[
            field("name"),
            field("type"),
            field("model"),
            field("info"),
            nested("outputs", OUTPUT_REF_RULES),
            nested(
                "instances",
                &[
                    field("info"),
                    field("location"),
                    field("data"),
                    nested("outputs", OUTPUT_REF_RULES),
                ],
            ),
        ],
    ),
];

/// The scheme of output type config documents.
pub(crate) const OUTPUT_TYPE_RULES: &[FieldRule] = &[
    field("version"),
    field("name"),
    field("precision"),
    nested("unit", &[field("name"), field("symbol")]),
    field("scalingFactor"),
    field("conversion"),
];

/// Validates a raw config tree against a scheme table. The document's
/// declared `version` must be present, parse, and match the supported scheme
/// major; each present field is then gated on that version. Returns the
/// parsed version on success.
pub(crate) fn validate(
    ctx: &ConfigContext<Value>,
    rules: &[FieldRule],
) -> Result<SchemeVersion, SdkError> {
    let source = ctx.source.to_string();
    let mapping = ctx.config.as_mapping().ok_or_else(|| SdkError::ParseError {
        source_name: source.clone(),
        reason: "config document is not a mapping".to_string(),
    })?;

    let version = document_version(mapping, &source)?;
    if !version.is_equal(&SchemeVersion::current()) {
        return Err(SdkError::VersionIncompatible {
            found: version.to_string(),
            supported: SCHEME_MAJOR,
        });
    }

    let mut errs = MultiError::new();
    walk(&ctx.config, rules, &version, &source, &mut errs);
    errs.into_result()?;
    Ok(version)
}

fn document_version(
    mapping: &serde_yaml::Mapping,
    source: &str,
) -> Result<SchemeVersion, SdkError> {
    let key = Value::String("version".to_string());
    let value = mapping.get(&key).ok_or_else(|| SdkError::ValidationError {
        context: source.to_string(),
        reason: "missing required 'version' field".to_string(),
    })?;
    let raw = match value {
        Value::String(s) => s.clone(),
        // An unquoted version like `version: 1` parses as a number.
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(SdkError::ValidationError {
                context: source.to_string(),
                reason: "'version' must be a scalar".to_string(),
            })
        }
    };
    SchemeVersion::parse(&raw)
}

fn walk(
    value: &Value,
    rules: &[FieldRule],
    version: &SchemeVersion,
    source: &str,
    errs: &mut MultiError,
) {
    match value {
        Value::Mapping(mapping) => {
            for rule in rules {
                let key = Value::String(rule.name.to_string());
                if let Some(field_value) = mapping.get(&key) {
                    check_gates(rule, version, source, errs);
                    if !rule.children.is_empty() {
                        walk(field_value, rule.children, version, source, errs);
                    }
                }
            }
        }
        Value::Sequence(elements) => {
            for element in elements {
                walk(element, rules, version, source, errs);
            }
        }
        _ => (),
    }
}

fn check_gates(rule: &FieldRule, version: &SchemeVersion, source: &str, errs: &mut MultiError) {
    if let Some(added) = &rule.added_in {
        if version.is_less_than(added) {
            errs.push(SdkError::ValidationError {
                context: source.to_string(),
                reason: format!(
                    "field '{}' was added in scheme version {}, but the document declares {}",
                    rule.name, added, version
                ),
            });
        }
    }
    if let Some(removed) = &rule.removed_in {
        if version.is_greater_or_equal(removed) {
            errs.push(SdkError::ValidationError {
                context: source.to_string(),
                reason: format!(
                    "field '{}' was removed in scheme version {}",
                    rule.name, removed
                ),
            });
        }
    }
    if let Some(deprecated) = &rule.deprecated_in {
        if version.is_greater_or_equal(deprecated) {
            warn!(
                source = %source,
                field = %rule.name,
                since = %deprecated,
                "config field is deprecated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConfigSource;
    use super::*;

    fn context(doc: &str) -> ConfigContext<Value> {
        ConfigContext::new(
            ConfigSource::File(std::path::PathBuf::from("test.yml")),
            serde_yaml::from_str(doc).unwrap(),
        )
    }

    #[test]
    fn valid_plugin_config_passes() {
        let ctx = context("version: \"1.0\"\nname: test\nloopDelay: 10\n");
        let version = validate(&ctx, PLUGIN_CONFIG_RULES).unwrap();
        assert_eq!(version.major, 1);
    }

    #[test]
    fn unquoted_version_is_accepted() {
        let ctx = context("version: 1\nname: test\n");
        assert!(validate(&ctx, PLUGIN_CONFIG_RULES).is_ok());
    }

    #[test]
    fn missing_version_fails() {
        let ctx = context("name: test\n");
        match validate(&ctx, PLUGIN_CONFIG_RULES) {
            Err(SdkError::ValidationError { reason, .. }) => {
                assert!(reason.contains("version"))
            }
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }

    #[test]
    fn unsupported_major_fails() {
        let ctx = context("version: \"2.0\"\nname: test\n");
        match validate(&ctx, PLUGIN_CONFIG_RULES) {
            Err(SdkError::VersionIncompatible { found, supported }) => {
                assert_eq!(found, "2.0");
                assert_eq!(supported, SCHEME_MAJOR);
            }
            other => panic!("expected VersionIncompatible, got {:?}", other),
        }
    }

    #[test]
    fn removed_field_fails() {
        let ctx = context("version: \"1.0\"\nname: test\nsocket: /tmp/old.sock\n");
        match validate(&ctx, PLUGIN_CONFIG_RULES) {
            Err(SdkError::Multi(errs)) => {
                assert_eq!(errs.len(), 1);
                assert!(format!("{}", errs).contains("socket"));
            }
            other => panic!("expected MultiError, got {:?}", other),
        }
    }

    #[test]
    fn not_yet_added_field_fails() {
        const RULES: &[FieldRule] = &[
            field("version"),
            FieldRule {
                name: "fancyNewKnob",
                added_in: Some(SchemeVersion::new(2, 0)),
                deprecated_in: None,
                removed_in: None,
                children: &[],
            },
        ];
        let ctx = context("version: \"1.0\"\nfancyNewKnob: true\n");
        match validate(&ctx, RULES) {
            Err(SdkError::Multi(errs)) => {
                assert!(format!("{}", errs).contains("fancyNewKnob"))
            }
            other => panic!("expected MultiError, got {:?}", other),
        }
    }

    #[test]
    fn violations_aggregate() {
        const RULES: &[FieldRule] = &[
            field("version"),
            removed("a", SchemeVersion::new(1, 0)),
            removed("b", SchemeVersion::new(1, 0)),
        ];
        let ctx = context("version: \"1.0\"\na: 1\nb: 2\n");
        match validate(&ctx, RULES) {
            Err(SdkError::Multi(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("expected MultiError, got {:?}", other),
        }
    }

    #[test]
    fn nested_fields_are_walked() {
        let ctx = context(
            r#"
version: "1.0"
devices:
  - name: temperature
    model: temp2010
    instances:
      - location: r1b1
"#,
        );
        assert!(validate(&ctx, DEVICE_CONFIG_RULES).is_ok());
    }

    #[test]
    fn non_mapping_document_fails() {
        let ctx = context("- a\n- b\n");
        match validate(&ctx, PLUGIN_CONFIG_RULES) {
            Err(SdkError::ParseError { .. }) => (),
            other => panic!("expected ParseError, got {:?}", other),
        }
    }
}
