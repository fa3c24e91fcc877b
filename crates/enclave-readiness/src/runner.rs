//! The readiness runner: poll every started service until ready or timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use enclave_backend::{ContainerBackend, EnclaveId, ServiceRegistration};

use crate::assertion::Assertion;
use crate::recipe::Recipe;
use crate::{ReadinessError, ReadinessResult};

/// Default pause between polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default ceiling on the whole polling loop.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A polling predicate gating batch-start success for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyCondition {
    pub recipe: Recipe,
    /// Field of the recipe result the assertion is applied to.
    pub field: String,
    pub assertion: Assertion,
    pub target: Value,
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl ReadyCondition {
    /// A condition with the default interval and timeout.
    pub fn new(recipe: Recipe, field: impl Into<String>, assertion: Assertion, target: Value) -> Self {
        Self {
            recipe,
            field: field.into(),
            assertion,
            target,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the interval from a duration literal like `"500ms"`.
    pub fn with_interval_literal(self, literal: &str) -> ReadinessResult<Self> {
        Ok(self.with_interval(parse_duration_literal(literal)?))
    }

    /// Set the timeout from a duration literal like `"15m"`.
    pub fn with_timeout_literal(self, literal: &str) -> ReadinessResult<Self> {
        Ok(self.with_timeout(parse_duration_literal(literal)?))
    }

    /// One probe: execute the recipe, extract the field, evaluate the
    /// assertion.
    async fn check_once(
        &self,
        backend: &dyn ContainerBackend,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
    ) -> ReadinessResult<bool> {
        let fields = self.recipe.execute(backend, enclave_id, registration).await?;
        let actual = fields
            .get(&self.field)
            .ok_or_else(|| ReadinessError::FieldMissing(self.field.clone()))?;
        self.assertion.evaluate(actual, &self.target)
    }
}

/// Parse a duration literal like `"500ms"` or `"15m"`.
pub fn parse_duration_literal(literal: &str) -> ReadinessResult<Duration> {
    humantime::parse_duration(literal).map_err(|e| ReadinessError::InvalidDuration {
        literal: literal.to_string(),
        message: e.to_string(),
    })
}

/// Wait for every `(registration, condition)` pair to pass, with at most
/// `batch_size` polls in flight at once.
///
/// The first failing service aborts the wait; dropping the task set cancels
/// the remaining in-flight polls, so nothing outlives this call.
pub async fn wait_for_all(
    backend: Arc<dyn ContainerBackend>,
    enclave_id: &EnclaveId,
    checks: Vec<(ServiceRegistration, ReadyCondition)>,
    batch_size: usize,
) -> ReadinessResult<()> {
    if checks.is_empty() {
        return Ok(());
    }
    let total = checks.len();
    let semaphore = Arc::new(Semaphore::new(batch_size.max(1)));
    let mut tasks = JoinSet::new();

    for (registration, condition) in checks {
        let backend = backend.clone();
        let enclave_id = enclave_id.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("readiness semaphore closed");
            wait_for_one(backend.as_ref(), &enclave_id, &registration, &condition).await
        });
    }

    let mut finished = 0;
    while let Some(joined) = tasks.join_next().await {
        finished += 1;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(ReadinessError::Task(join_err.to_string())),
        }
    }
    debug_assert_eq!(finished, total);
    info!(services = total, "all services passed readiness");
    Ok(())
}

async fn wait_for_one(
    backend: &dyn ContainerBackend,
    enclave_id: &EnclaveId,
    registration: &ServiceRegistration,
    condition: &ReadyCondition,
) -> ReadinessResult<()> {
    let deadline = Instant::now() + condition.timeout;
    let mut polls: u32 = 0;
    loop {
        polls += 1;
        match condition.check_once(backend, enclave_id, registration).await {
            Ok(true) => {
                debug!(service_id = %registration.id, polls, "service is ready");
                return Ok(());
            }
            Ok(false) => {}
            // A failed recipe or an unextractable field is a failed attempt,
            // not a hard error; the service may simply not be up yet.
            Err(err) => {
                debug!(service_id = %registration.id, error = %err, "readiness probe attempt failed");
            }
        }
        if Instant::now() + condition.interval > deadline {
            return Err(ReadinessError::Timeout {
                service_id: registration.id.clone(),
                timeout: condition.timeout,
            });
        }
        tokio::time::sleep(condition.interval).await;
    }
}
