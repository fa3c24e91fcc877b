//! Recipes: how a readiness probe observes a service.
//!
//! A closed sum at the scripting boundary — either an HTTP request against
//! one of the service's private ports or an exec inside its container. Both
//! produce a flat field map the assertion is evaluated against.

use std::collections::BTreeMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use enclave_backend::{ContainerBackend, EnclaveId, ServiceRegistration};

use crate::{ReadinessError, ReadinessResult};

/// HTTP method of an [`HttpRecipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    fn as_http(&self) -> http::Method {
        match self {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Post => http::Method::POST,
        }
    }
}

/// An HTTP request against the service's private IP.
///
/// Result fields: `code` (status), `body` (response text), plus one field
/// per `extract` entry, looked up in the JSON response body by pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRecipe {
    pub port_number: u16,
    pub method: HttpMethod,
    /// Request path, e.g. `/health`.
    pub endpoint: String,
    pub content_type: Option<String>,
    pub body: Option<String>,
    /// Field name → JSON pointer into the response body (e.g. `/status`).
    pub extract: BTreeMap<String, String>,
}

impl HttpRecipe {
    pub fn get(port_number: u16, endpoint: impl Into<String>) -> Self {
        Self {
            port_number,
            method: HttpMethod::Get,
            endpoint: endpoint.into(),
            content_type: None,
            body: None,
            extract: BTreeMap::new(),
        }
    }

    pub fn with_extract(mut self, field: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.extract.insert(field.into(), pointer.into());
        self
    }
}

/// An exec inside the service container.
///
/// Result fields: `code` (exit code) and `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRecipe {
    pub command: Vec<String>,
}

/// What a readiness probe runs against the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipe {
    Http(HttpRecipe),
    Exec(ExecRecipe),
}

impl Recipe {
    /// Run the recipe once and return its field map.
    pub async fn execute(
        &self,
        backend: &dyn ContainerBackend,
        enclave_id: &EnclaveId,
        registration: &ServiceRegistration,
    ) -> ReadinessResult<BTreeMap<String, Value>> {
        match self {
            Recipe::Http(recipe) => execute_http(recipe, registration).await,
            Recipe::Exec(recipe) => execute_exec(recipe, backend, enclave_id, registration).await,
        }
    }
}

async fn execute_http(
    recipe: &HttpRecipe,
    registration: &ServiceRegistration,
) -> ReadinessResult<BTreeMap<String, Value>> {
    let address = format!("{}:{}", registration.private_ip, recipe.port_number);

    let stream = TcpStream::connect(&address)
        .await
        .map_err(|e| ReadinessError::Recipe(format!("connecting to {address}: {e}")))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ReadinessError::Recipe(format!("handshake with {address}: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = http::Request::builder()
        .method(recipe.method.as_http())
        .uri(&recipe.endpoint)
        .header("host", &address);
    if let Some(content_type) = &recipe.content_type {
        builder = builder.header("content-type", content_type);
    }
    let body = recipe
        .body
        .as_ref()
        .map(|b| Bytes::from(b.clone()))
        .unwrap_or_default();
    let request = builder
        .body(Full::new(body))
        .map_err(|e| ReadinessError::Recipe(format!("building request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ReadinessError::Recipe(format!("request to {address}: {e}")))?;
    let status = response.status().as_u16();
    let collected = response
        .collect()
        .await
        .map_err(|e| ReadinessError::Recipe(format!("reading body from {address}: {e}")))?;
    let body_text = String::from_utf8_lossy(&collected.to_bytes()).into_owned();

    let mut fields = BTreeMap::from([
        ("code".to_string(), Value::from(status)),
        ("body".to_string(), Value::from(body_text.clone())),
    ]);

    if !recipe.extract.is_empty() {
        let parsed: Value = serde_json::from_str(&body_text)
            .map_err(|e| ReadinessError::Recipe(format!("response body is not JSON: {e}")))?;
        for (field, pointer) in &recipe.extract {
            let value = parsed
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| ReadinessError::FieldMissing(field.clone()))?;
            fields.insert(field.clone(), value);
        }
    }

    debug!(service_id = %registration.id, %address, status, "http recipe executed");
    Ok(fields)
}

async fn execute_exec(
    recipe: &ExecRecipe,
    backend: &dyn ContainerBackend,
    enclave_id: &EnclaveId,
    registration: &ServiceRegistration,
) -> ReadinessResult<BTreeMap<String, Value>> {
    let commands = BTreeMap::from([(registration.guid.clone(), recipe.command.clone())]);
    let (mut results, mut failures) = backend
        .run_user_service_exec_commands(enclave_id, &commands)
        .await?;

    if let Some(err) = failures.remove(&registration.guid) {
        return Err(ReadinessError::Backend(err));
    }
    let result = results.remove(&registration.guid).ok_or_else(|| {
        ReadinessError::Recipe(format!(
            "backend returned no exec result for service '{}'",
            registration.id
        ))
    })?;

    Ok(BTreeMap::from([
        ("code".to_string(), Value::from(result.exit_code)),
        ("output".to_string(), Value::from(result.output)),
    ]))
}
