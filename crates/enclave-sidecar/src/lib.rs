//! enclave-sidecar — per-service traffic-shaping controllers.
//!
//! Each user service gets a privileged companion container on the same
//! network namespace. This crate owns the [`NetworkingSidecar`] wrapper that
//! translates a per-destination packet-loss mapping into the `tc` command
//! sequence run inside that companion, and the [`SidecarManager`] that
//! creates and destroys the companions through the container backend.
//!
//! The wrapper is not internally synchronized; the service network's
//! enclave-wide mutex serializes all calls.

pub mod manager;
pub mod shaper;

pub use manager::SidecarManager;
pub use shaper::{NetworkingSidecar, SidecarError, SidecarResult};
