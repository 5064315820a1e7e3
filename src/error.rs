//! Error Module - SLS Error Types
//!
//! Defines the fixed error taxonomy used throughout the store. Every
//! operation that can fail returns `Result<T>` rather than panicking;
//! the only panics that remain are genuine programming-error invariants
//! (poisoned locks surface as `SlsError::LockPoisoned` instead).

use std::sync::PoisonError;
use thiserror::Error;

/// Main error type for all store operations.
#[derive(Debug, Error)]
pub enum SlsError {
    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("region truncated: next_alloc_offset {next_alloc} exceeds mapped size {mapped}")]
    Truncated { next_alloc: u64, mapped: u64 },

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: u64, available: u64 },

    #[error("exhausted: {resource} pool is full ({limit} max)")]
    Exhausted { resource: String, limit: usize },

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("conflict: commit observed root generation {observed}, began at {started}")]
    Conflict { started: u64, observed: u64 },

    #[error("cycle detected while walking next-pointers from offset {0:#x}")]
    CycleDetected(u64),

    #[error("null violation: NotNullPtr field at offset {0:#x} is null")]
    NullViolation(u64),

    #[error("bounds exceeded: count {count} * elem_size {elem_size} exceeds alloc_size {alloc_size}")]
    BoundsExceeded {
        count: u64,
        elem_size: u64,
        alloc_size: u64,
    },

    #[error("refcount invalid: value {value} below minimum {min}")]
    RefcountInvalid { value: i64, min: i64 },

    #[error("range exceeded: value {value} outside [{min}, {max}]")]
    RangeExceeded { value: i64, min: i64, max: i64 },

    #[error("custom validator failed: {0}")]
    CustomFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl SlsError {
    /// Whether the caller might reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SlsError::OutOfSpace { .. } | SlsError::Exhausted { .. } | SlsError::Conflict { .. }
        )
    }

    /// Whether this error reflects a validation failure against a
    /// semantic checkpoint invariant, as opposed to a substrate fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SlsError::CycleDetected(_)
                | SlsError::NullViolation(_)
                | SlsError::BoundsExceeded { .. }
                | SlsError::RefcountInvalid { .. }
                | SlsError::RangeExceeded { .. }
                | SlsError::CustomFailed(_)
        )
    }
}

impl<T> From<PoisonError<T>> for SlsError {
    fn from(err: PoisonError<T>) -> Self {
        SlsError::LockPoisoned(err.to_string())
    }
}

impl From<crate::config::ConfigError> for SlsError {
    fn from(err: crate::config::ConfigError) -> Self {
        SlsError::Invalid(err.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, SlsError>;

/// Early-return with a formatted `SlsError::Invalid`.
#[macro_export]
macro_rules! bail_invalid {
    ($($arg:tt)*) => {
        return Err($crate::error::SlsError::Invalid(format!($($arg)*)))
    };
}

/// Ensure a condition holds, otherwise return the given error.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(SlsError::OutOfSpace {
            requested: 8,
            available: 0
        }
        .is_recoverable());
        assert!(!SlsError::BadFormat("x".into()).is_recoverable());
    }

    #[test]
    fn invariant_classification() {
        assert!(SlsError::CycleDetected(0).is_invariant_violation());
        assert!(!SlsError::NotFound("x".into()).is_invariant_violation());
    }
}
