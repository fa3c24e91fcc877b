//! enclave-instructions — the thin instruction surface the scripting layer
//! calls.
//!
//! Each instruction validates its arguments and delegates to the service
//! network; the interesting semantics (pre-blocking, all-or-nothing
//! rollback, readiness gating) live there. The one piece of policy owned
//! here is that a failed `add_services` deregisters every service the call
//! itself registered, so the enclave is left exactly as it was found.

pub mod endpoint;
pub mod error;
pub mod files;
pub mod partition;
pub mod services;

pub use endpoint::wait_for_endpoint_availability;
pub use error::{InstructionError, InstructionResult};
pub use files::{render_templates, store_service_files, upload_files, TemplateAndData};
pub use partition::repartition;
pub use services::{
    add_service, add_services, exec, remove_service, AddServiceSpec,
    DEFAULT_CONTAINER_STOP_TIMEOUT,
};
