//! Error types for the SDK. Configuration and validation errors propagate up
//! the startup chain, aggregating independent failures into a [`MultiError`];
//! handler errors are local to a scheduler iteration; RPC errors are per-call.

use std::fmt;

use thiserror::Error;

/// The errors produced by the SDK.
#[derive(Error, Debug)]
pub enum SdkError {
    /// A configuration artifact was absent on disk. This is the only load
    /// error that is negotiable by config policy.
    #[error("configuration not found: {0}")]
    ConfigNotFound(String),

    /// A YAML document or scalar failed to parse. Fatal at startup.
    #[error("failed to parse {source_name}: {reason}")]
    ParseError {
        /// The config source that failed to parse.
        source_name: String,
        /// What went wrong.
        reason: String,
    },

    /// A scheme or semantic check failed.
    #[error("validation failed for {context}: {reason}")]
    ValidationError {
        /// What was being validated.
        context: String,
        /// What went wrong.
        reason: String,
    },

    /// A required config source was absent, or a prohibited source was the
    /// only thing supplying config. Fatal at startup.
    #[error("config policy violation: {0}")]
    PolicyViolation(String),

    /// A config document's major version does not match the scheme major
    /// supported by the SDK. Fatal at startup.
    #[error("config version '{found}' is not supported (supported major: {supported})")]
    VersionIncompatible {
        /// The version string found in the config.
        found: String,
        /// The scheme major version the SDK supports.
        supported: u32,
    },

    /// A device handler's read or write returned an error. The scheduler
    /// logs these and keeps running.
    #[error("device handler error: {0}")]
    HandlerError(String),

    /// The write queue is at capacity. Surfaced to RPC callers as
    /// `ResourceExhausted`; the caller is never blocked.
    #[error("write queue is full")]
    QueueFull,

    /// An RPC referenced a device ID that is not in the registry.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// A reading value cannot be processed, e.g. a non-numeric value was
    /// given to a scaling output. Indicates a plugin bug.
    #[error("unsupported reading value: {0}")]
    UnsupportedValue(String),

    /// Multiple independent errors, typically from validation.
    #[error(transparent)]
    Multi(#[from] MultiError),

    /// An I/O error from reading configuration off disk. Not negotiable by
    /// policy; fatal at startup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An aggregate of independent errors. Validation collects everything wrong
/// with a config set rather than bailing on the first problem, so the full
/// list is available for diagnostics.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<SdkError>,
}

impl MultiError {
    /// Returns a new, empty `MultiError`.
    pub fn new() -> Self {
        MultiError::default()
    }

    /// Adds an error to the aggregate.
    pub fn push(&mut self, err: SdkError) {
        self.errors.push(err);
    }

    /// Whether any errors have been collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The collected errors.
    pub fn errors(&self) -> &[SdkError] {
        &self.errors
    }

    /// Resolves the aggregate: `Ok` if nothing was collected, otherwise an
    /// `SdkError` holding every collected error.
    pub fn into_result(self) -> Result<(), SdkError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(SdkError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "{}", self.errors[0]);
        }
        writeln!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            writeln!(f, "  * {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_empty_is_ok() {
        let errs = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn multi_error_single_displays_inner() {
        let mut errs = MultiError::new();
        errs.push(SdkError::UnknownDevice("abc123".to_string()));
        assert_eq!(format!("{}", errs), "unknown device: abc123");
    }

    #[test]
    fn multi_error_aggregates() {
        let mut errs = MultiError::new();
        errs.push(SdkError::QueueFull);
        errs.push(SdkError::UnknownDevice("abc123".to_string()));
        assert_eq!(errs.len(), 2);

        let display = format!("{}", errs);
        assert!(display.contains("2 errors occurred"));
        assert!(display.contains("write queue is full"));
        assert!(display.contains("unknown device: abc123"));

        match errs.into_result() {
            Err(SdkError::Multi(inner)) => assert_eq!(inner.len(), 2),
            other => panic!("expected MultiError, got {:?}", other),
        }
    }
}
