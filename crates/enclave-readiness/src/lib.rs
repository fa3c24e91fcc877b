//! enclave-readiness — polling gates for freshly started services.
//!
//! A readiness condition pairs a [`Recipe`] (an HTTP request against the
//! service's private IP, or an exec inside its container) with a field to
//! extract from the recipe's result and an [`Assertion`] against a target
//! value. The [`runner`] polls each started service's condition until it
//! passes or times out, with bounded concurrency across services.

pub mod assertion;
pub mod recipe;
pub mod runner;

use std::time::Duration;

use thiserror::Error;

use enclave_backend::{BackendError, ServiceId};

pub use assertion::Assertion;
pub use recipe::{ExecRecipe, HttpMethod, HttpRecipe, Recipe};
pub use runner::{wait_for_all, ReadyCondition, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};

/// Errors raised while evaluating readiness conditions.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("service '{service_id}' did not become ready within {timeout:?}")]
    Timeout {
        service_id: ServiceId,
        timeout: Duration,
    },

    #[error("unknown assertion token '{0}'")]
    UnknownAssertion(String),

    #[error("recipe execution failed: {0}")]
    Recipe(String),

    #[error("recipe result has no field '{0}'")]
    FieldMissing(String),

    #[error("cannot order {actual} against {target}; ordering needs two numbers or two strings")]
    Incomparable { actual: String, target: String },

    #[error("IN / NOT_IN target must be an array, got {0}")]
    TargetNotArray(String),

    #[error("invalid duration literal '{literal}': {message}")]
    InvalidDuration { literal: String, message: String },

    #[error("readiness task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type ReadinessResult<T> = Result<T, ReadinessError>;
