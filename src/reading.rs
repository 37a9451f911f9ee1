//! Readings and reading values. A device handler produces [`Reading`]s with
//! dynamically-typed [`Value`]s; the scheduler stamps timestamps, applies the
//! device's output type, and publishes the result to the reading cache. On
//! the wire, values map onto a fixed set of protobuf variants, with narrow
//! integer widths widened to the next supported width.

use chrono::{DateTime, Utc};

use crate::api::v3 as api;
use crate::output::Unit;

/// A dynamically-typed reading value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A string value.
    String(String),
    /// A boolean value.
    Bool(bool),
    /// A 32-bit float value.
    Float32(f32),
    /// A 64-bit float value.
    Float64(f64),
    /// An 8-bit signed integer value.
    Int8(i8),
    /// A 16-bit signed integer value.
    Int16(i16),
    /// A 32-bit signed integer value.
    Int32(i32),
    /// A 64-bit signed integer value.
    Int64(i64),
    /// An 8-bit unsigned integer value.
    Uint8(u8),
    /// A 16-bit unsigned integer value.
    Uint16(u16),
    /// A 32-bit unsigned integer value.
    Uint32(u32),
    /// A 64-bit unsigned integer value.
    Uint64(u64),
    /// A raw bytes value.
    Bytes(Vec<u8>),
    /// No value.
    Nil,
}

impl Value {
    /// The value as a 64-bit float, when it is numeric. Booleans, strings,
    /// bytes, and nil are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            Value::Int8(v) => Some(f64::from(*v)),
            Value::Int16(v) => Some(f64::from(*v)),
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Uint8(v) => Some(f64::from(*v)),
            Value::Uint16(v) => Some(f64::from(*v)),
            Value::Uint32(v) => Some(f64::from(*v)),
            Value::Uint64(v) => Some(*v as f64),
            Value::String(_) | Value::Bool(_) | Value::Bytes(_) | Value::Nil => None,
        }
    }

    /// The wire representation of the value. `Nil` has no wire variant: it
    /// encodes as an unset field.
    pub(crate) fn to_wire(&self) -> Option<api::reading::Value> {
        use api::reading::Value as Wire;
        match self {
            Value::String(v) => Some(Wire::StringValue(v.clone())),
            Value::Bool(v) => Some(Wire::BoolValue(*v)),
            Value::Float32(v) => Some(Wire::Float32Value(*v)),
            Value::Float64(v) => Some(Wire::Float64Value(*v)),
            Value::Int8(v) => Some(Wire::Int32Value(i32::from(*v))),
            Value::Int16(v) => Some(Wire::Int32Value(i32::from(*v))),
            Value::Int32(v) => Some(Wire::Int32Value(*v)),
            Value::Int64(v) => Some(Wire::Int64Value(*v)),
            Value::Uint8(v) => Some(Wire::Uint32Value(u32::from(*v))),
            Value::Uint16(v) => Some(Wire::Uint32Value(u32::from(*v))),
            Value::Uint32(v) => Some(Wire::Uint32Value(*v)),
            Value::Uint64(v) => Some(Wire::Uint64Value(*v)),
            Value::Bytes(v) => Some(Wire::BytesValue(v.clone())),
            Value::Nil => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Uint8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Uint16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A single timestamped value produced by a device handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// When the reading was taken. The scheduler stamps this with the
    /// current time if the handler leaves it unset.
    pub timestamp: Option<DateTime<Utc>>,

    /// The name of the output type that produced this reading. This may be
    /// the full dotted name or just its type segment; the scheduler resolves
    /// it against the device's outputs.
    pub output: String,

    /// Free-form context for the reading. Lands under `context["info"]` on
    /// the wire.
    pub info: String,

    /// The unit of the reading, filled in from the resolved output type.
    pub unit: Option<Unit>,

    /// The value of the reading.
    pub value: Value,
}

impl Reading {
    /// Returns a new reading for the named output with no timestamp; the
    /// scheduler will stamp it when the reading is collected.
    pub fn new<V: Into<Value>>(output: &str, value: V) -> Self {
        Reading {
            timestamp: None,
            output: output.to_string(),
            info: String::new(),
            unit: None,
            value: value.into(),
        }
    }

    /// Sets the reading's info string.
    pub fn with_info(mut self, info: &str) -> Self {
        self.info = info.to_string();
        self
    }

    /// Sets the reading's timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The wire representation of the reading.
    pub(crate) fn to_rpc(&self) -> api::Reading {
        let mut context = std::collections::HashMap::new();
        if !self.info.is_empty() {
            context.insert("info".to_string(), self.info.clone());
        }
        api::Reading {
            timestamp: self
                .timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
            r#type: self.output.clone(),
            context,
            unit: self.unit.as_ref().map(|u| api::OutputUnit {
                name: u.name.clone(),
                symbol: u.symbol.clone(),
            }),
            value: self.value.to_wire(),
        }
    }
}

/// Everything one poll of a single device produced. This is the message the
/// scheduler publishes to the read channel and the unit the reading cache
/// stores.
#[derive(Debug, Clone)]
pub(crate) struct DeviceReadings {
    pub device_id: String,
    pub readings: Vec<Reading>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::reading::Value as Wire;

    #[test]
    fn narrow_integers_widen_on_the_wire() {
        assert_eq!(Value::Int8(-3).to_wire(), Some(Wire::Int32Value(-3)));
        assert_eq!(Value::Int16(72).to_wire(), Some(Wire::Int32Value(72)));
        assert_eq!(Value::Uint8(3).to_wire(), Some(Wire::Uint32Value(3)));
        assert_eq!(Value::Uint16(9).to_wire(), Some(Wire::Uint32Value(9)));
    }

    #[test]
    fn wide_values_keep_their_width() {
        assert_eq!(Value::Int64(-9).to_wire(), Some(Wire::Int64Value(-9)));
        assert_eq!(Value::Uint64(9).to_wire(), Some(Wire::Uint64Value(9)));
        assert_eq!(Value::Float32(1.5).to_wire(), Some(Wire::Float32Value(1.5)));
        assert_eq!(Value::Float64(2.5).to_wire(), Some(Wire::Float64Value(2.5)));
    }

    #[test]
    fn nil_has_no_wire_variant() {
        assert_eq!(Value::Nil.to_wire(), None);
    }

    #[test]
    fn as_f64_is_numeric_only() {
        assert_eq!(Value::Int16(72).as_f64(), Some(72.0));
        assert_eq!(Value::Uint64(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float32(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::Bool(true).as_f64(), None);
        assert_eq!(Value::String("72".to_string()).as_f64(), None);
        assert_eq!(Value::Nil.as_f64(), None);
    }

    #[test]
    fn info_lands_in_wire_context() {
        let reading = Reading::new("temperature", Value::Int16(72)).with_info("cpu inlet");
        let rpc = reading.to_rpc();
        assert_eq!(rpc.context.get("info").map(String::as_str), Some("cpu inlet"));
        assert_eq!(rpc.r#type, "temperature");
        assert_eq!(rpc.value, Some(Wire::Int32Value(72)));
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let now = Utc::now();
        let reading = Reading::new("temperature", 1i64).with_timestamp(now);
        let rpc = reading.to_rpc();
        assert_eq!(rpc.timestamp, now.to_rfc3339());
    }
}
