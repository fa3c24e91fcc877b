//! Instruction-layer error types.

use std::collections::BTreeMap;

use thiserror::Error;

use enclave_backend::ServiceId;
use enclave_network::NetworkError;
use enclave_readiness::ReadinessError;

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("parallelism must be at least 1, got {0}")]
    InvalidParallelism(usize),

    #[error("'configs' must name at least one service")]
    EmptyBatch,

    #[error(
        "{} service(s) failed to start; the batch was rolled back and no service was added: {failures:?}",
        failures.len()
    )]
    AddServicesFailed {
        failures: BTreeMap<ServiceId, NetworkError>,
    },

    #[error("endpoint '{url}' was not available after {attempts} attempt(s)")]
    EndpointUnavailable { url: String, attempts: u32 },

    #[error("rendering template for '{destination}' failed: {message}")]
    Template {
        destination: String,
        message: String,
    },

    #[error("packaging files artifact failed: {0}")]
    Archive(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

pub type InstructionResult<T> = Result<T, InstructionError>;
