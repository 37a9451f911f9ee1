//! Output types describe how a raw value produced by a device handler
//! becomes a reading: the scaling factor to apply, the unit to attach, and
//! any named unit conversion to run. Output types are defined in config (or
//! registered in code) and are immutable once the plugin is built. They live
//! in an arena indexed by their dotted name; devices reference them by arena
//! index.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::errors::SdkError;
use crate::reading::Value;

lazy_static::lazy_static! {
    // A decimal literal: [+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?
    static ref SCALING_FACTOR: Regex =
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").unwrap();
}

/// The conversion from Fahrenheit to Celsius.
pub const ENGLISH_TO_METRIC_TEMPERATURE: &str = "englishToMetricTemperature";

/// The unit of measure for a reading. Either field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Unit {
    /// The full name of the unit, e.g. "celsius".
    #[serde(default)]
    pub name: String,
    /// The symbolic representation of the unit, e.g. "C".
    #[serde(default)]
    pub symbol: String,
}

/// Describes how a value becomes a reading.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputType {
    /// The namespaced, dotted name of the output type. The type of the
    /// output is the last segment of the name.
    pub name: String,

    /// The decimal precision of the reading. A value of 0 means no rounding
    /// is applied.
    #[serde(default)]
    pub precision: i32,

    /// The unit of the reading.
    #[serde(default)]
    pub unit: Unit,

    /// A decimal literal to multiply readings by. Empty and "0" both mean
    /// the identity.
    #[serde(default)]
    pub scaling_factor: String,

    /// The name of a conversion to apply to scaled readings, e.g.
    /// `englishToMetricTemperature`.
    #[serde(default)]
    pub conversion: String,

    #[serde(skip)]
    factor: OnceLock<Option<f64>>,
}

impl OutputType {
    /// Returns a new output type with the given name and no scaling.
    pub fn new(name: &str) -> Self {
        OutputType {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Sets the decimal precision.
    pub fn with_precision(mut self, precision: i32) -> Self {
        self.precision = precision;
        self
    }

    /// Sets the unit.
    pub fn with_unit(mut self, name: &str, symbol: &str) -> Self {
        self.unit = Unit {
            name: name.to_string(),
            symbol: symbol.to_string(),
        };
        self
    }

    /// Sets the scaling factor.
    pub fn with_scaling_factor(mut self, factor: &str) -> Self {
        self.scaling_factor = factor.to_string();
        self
    }

    /// Sets the conversion.
    pub fn with_conversion(mut self, conversion: &str) -> Self {
        self.conversion = conversion.to_string();
        self
    }

    /// The type of the output: the last segment of its dotted name.
    pub fn type_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Checks that the output type is well-formed: the name is non-empty,
    /// the scaling factor (if any) parses to a finite real, and the
    /// conversion (if any) is recognized. This runs at config load, before
    /// any reading flows.
    pub fn validate(&self) -> Result<(), SdkError> {
        if self.name.is_empty() {
            return Err(SdkError::ValidationError {
                context: "output type".to_string(),
                reason: "name may not be empty".to_string(),
            });
        }
        parse_scaling_factor(&self.name, &self.scaling_factor)?;
        if !self.conversion.is_empty() && self.conversion != ENGLISH_TO_METRIC_TEMPERATURE {
            return Err(SdkError::ValidationError {
                context: format!("output type '{}'", self.name),
                reason: format!("unrecognized conversion '{}'", self.conversion),
            });
        }
        Ok(())
    }

    /// Applies the output's scaling factor and conversion to a value.
    ///
    /// A factor of 0 or 1 passes the value through unchanged, preserving its
    /// dynamic type. Any other factor coerces the value to a 64-bit float,
    /// multiplies, and runs the conversion; non-numeric values are an error
    /// in that case.
    pub fn apply(&self, value: Value) -> Result<Value, SdkError> {
        let factor = match self.factor() {
            Some(f) => f,
            // Unparseable factor: already logged, leave the value alone.
            None => return Ok(value),
        };
        if factor == 0.0 || factor == 1.0 {
            return Ok(value);
        }

        let raw = value.as_f64().ok_or_else(|| {
            SdkError::UnsupportedValue(format!(
                "output '{}' cannot scale non-numeric value {:?}",
                self.name, value
            ))
        })?;

        let mut scaled = convert(&self.conversion, raw * factor)?;
        if self.precision > 0 {
            let shift = 10f64.powi(self.precision);
            scaled = (scaled * shift).round() / shift;
        }
        Ok(Value::Float64(scaled))
    }

    // The parsed scaling factor, cached on first use. None means the factor
    // string does not parse; that is logged once and readings pass through
    // unscaled.
    fn factor(&self) -> Option<f64> {
        *self.factor.get_or_init(|| {
            match parse_scaling_factor(&self.name, &self.scaling_factor) {
                Ok(f) => Some(f),
                Err(err) => {
                    warn!(output = %self.name, error = %err, "failed to parse scaling factor, readings will not be scaled");
                    None
                }
            }
        })
    }
}

/// Parses a scaling factor string. The empty string is the identity.
fn parse_scaling_factor(output: &str, factor: &str) -> Result<f64, SdkError> {
    if factor.is_empty() {
        return Ok(1.0);
    }
    let invalid = |reason: String| SdkError::ParseError {
        source_name: format!("scaling factor of output '{}'", output),
        reason,
    };
    if !SCALING_FACTOR.is_match(factor) {
        return Err(invalid(format!("'{}' is not a decimal literal", factor)));
    }
    let parsed = factor
        .parse::<f64>()
        .map_err(|err| invalid(format!("'{}': {}", factor, err)))?;
    if !parsed.is_finite() {
        return Err(invalid(format!("'{}' is not finite", factor)));
    }
    Ok(parsed)
}

/// Runs the named conversion on a value. Unrecognized conversions are
/// rejected when the output type is validated, so this only sees known tags.
fn convert(conversion: &str, value: f64) -> Result<f64, SdkError> {
    match conversion {
        "" => Ok(value),
        ENGLISH_TO_METRIC_TEMPERATURE => Ok((value - 32.0) * 5.0 / 9.0),
        other => Err(SdkError::ValidationError {
            context: "conversion".to_string(),
            reason: format!("unrecognized conversion '{}'", other),
        }),
    }
}

/// The arena of output types known to a plugin, indexed by dotted name.
/// Devices hold arena indices rather than references.
#[derive(Debug, Default)]
pub struct Outputs {
    types: Vec<OutputType>,
    index: HashMap<String, usize>,
}

impl Outputs {
    /// Returns a new, empty arena.
    pub fn new() -> Self {
        Outputs::default()
    }

    /// Validates and adds an output type to the arena, returning its index.
    /// Registering two output types with the same name is an error.
    pub fn register(&mut self, output: OutputType) -> Result<usize, SdkError> {
        output.validate()?;
        if self.index.contains_key(&output.name) {
            return Err(SdkError::ValidationError {
                context: format!("output type '{}'", output.name),
                reason: "an output type with this name is already registered".to_string(),
            });
        }
        let idx = self.types.len();
        self.index.insert(output.name.clone(), idx);
        self.types.push(output);
        Ok(idx)
    }

    /// Looks up an output type by its dotted name.
    pub fn get(&self, name: &str) -> Option<&OutputType> {
        self.index.get(name).map(|idx| &self.types[*idx])
    }

    /// Looks up the arena index of an output type by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Looks up an output type by arena index.
    pub fn by_index(&self, idx: usize) -> Option<&OutputType> {
        self.types.get(idx)
    }

    /// The number of registered output types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterates over the registered output types.
    pub fn iter(&self) -> impl Iterator<Item = &OutputType> {
        self.types.iter()
    }
}
