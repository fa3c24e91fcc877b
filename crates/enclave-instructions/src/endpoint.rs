//! The `wait_for_endpoint_availability` instruction.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use enclave_backend::ServiceId;
use enclave_network::ServiceNetwork;
use enclave_readiness::{HttpMethod, HttpRecipe, Recipe};

use crate::error::{InstructionError, InstructionResult};

/// Poll an HTTP endpoint on a running service until it answers 200 (and,
/// when given, with exactly `expected_body_text`).
///
/// `retries = 0` still runs one probe: the initial delay plus a single
/// attempt.
#[allow(clippy::too_many_arguments)]
pub async fn wait_for_endpoint_availability(
    network: &ServiceNetwork,
    service_id: &ServiceId,
    port: u16,
    path: &str,
    method: HttpMethod,
    initial_delay: Duration,
    retries: u32,
    retry_interval: Duration,
    expected_body_text: Option<String>,
) -> InstructionResult<()> {
    let service = network.get_service(service_id).await?;
    let backend = network.backend();
    let url = format!("http://{}:{}{}", service.registration.private_ip, port, path);

    let recipe = Recipe::Http(HttpRecipe {
        port_number: port,
        method,
        endpoint: path.to_string(),
        content_type: None,
        body: None,
        extract: Default::default(),
    });

    tokio::time::sleep(initial_delay).await;
    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(retry_interval).await;
        }
        match recipe
            .execute(backend.as_ref(), network.enclave_id(), &service.registration)
            .await
        {
            Ok(fields) => {
                let code_ok = fields.get("code") == Some(&Value::from(200));
                let body_ok = match &expected_body_text {
                    Some(expected) => {
                        fields.get("body").and_then(Value::as_str) == Some(expected.as_str())
                    }
                    None => true,
                };
                if code_ok && body_ok {
                    debug!(%service_id, %url, attempt, "endpoint is available");
                    return Ok(());
                }
                debug!(%service_id, %url, attempt, "endpoint answered but did not match");
            }
            Err(err) => {
                debug!(%service_id, %url, attempt, error = %err, "endpoint probe failed");
            }
        }
    }

    Err(InstructionError::EndpointUnavailable {
        url,
        attempts: retries + 1,
    })
}
