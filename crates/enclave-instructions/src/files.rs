//! `upload_files`, `render_templates`, and `store_service_files`.
//!
//! The artifact store holds tar.gz blobs, so rendered templates are packed
//! into a minimal ustar archive here before gzip framing. Rendering is
//! plain `{{key}}` substitution from a JSON object.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::info;

use enclave_backend::{ArtifactUuid, FilesArtifactStore, ServiceId};
use enclave_network::ServiceNetwork;

use crate::error::{InstructionError, InstructionResult};

/// One template plus the JSON object its placeholders are filled from.
#[derive(Debug, Clone)]
pub struct TemplateAndData {
    pub template: String,
    pub data: Value,
}

/// Append a caller-packaged tar.gz blob to the artifact store.
pub async fn upload_files(
    store: &Arc<dyn FilesArtifactStore>,
    content: Vec<u8>,
) -> InstructionResult<ArtifactUuid> {
    let store = store.clone();
    let uuid = tokio::task::spawn_blocking(move || {
        store.store_file(&mut std::io::Cursor::new(content))
    })
    .await
    .map_err(|e| InstructionError::Archive(e.to_string()))?
    .map_err(|e| InstructionError::Archive(e.to_string()))?;
    info!(artifact = %uuid, "files uploaded into artifact store");
    Ok(uuid)
}

/// Render every template against its data, pack the results as tar.gz, and
/// store the blob. Keys of `templates` are destination paths inside the
/// artifact.
pub async fn render_templates(
    store: &Arc<dyn FilesArtifactStore>,
    templates: BTreeMap<String, TemplateAndData>,
) -> InstructionResult<ArtifactUuid> {
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (destination, spec) in &templates {
        let rendered = render_template(&spec.template, &spec.data).map_err(|message| {
            InstructionError::Template {
                destination: destination.clone(),
                message,
            }
        })?;
        entries.insert(destination.clone(), rendered.into_bytes());
    }

    let tar = build_ustar(&entries).map_err(InstructionError::Archive)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar)
        .map_err(|e| InstructionError::Archive(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| InstructionError::Archive(e.to_string()))?;

    let uuid = upload_files(store, compressed).await?;
    info!(files = templates.len(), artifact = %uuid, "templates rendered into artifact store");
    Ok(uuid)
}

/// Copy files out of a running service into the artifact store.
pub async fn store_service_files(
    network: &ServiceNetwork,
    service_id: &ServiceId,
    src_path: &str,
) -> InstructionResult<ArtifactUuid> {
    Ok(network.copy_files_from_service(service_id, src_path).await?)
}

// ── Template rendering ─────────────────────────────────────────────

/// Substitute every `{{key}}` in `template` from the JSON object `data`.
fn render_template(template: &str, data: &Value) -> Result<String, String> {
    let object = data
        .as_object()
        .ok_or_else(|| "template data must be a JSON object".to_string())?;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| "unclosed '{{' placeholder".to_string())?;
        let key = after[..end].trim();
        let value = object
            .get(key)
            .ok_or_else(|| format!("no value for placeholder '{key}'"))?;
        out.push_str(&render_value(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Minimal ustar writer ───────────────────────────────────────────

const BLOCK: usize = 512;

/// Build a POSIX ustar archive of `entries` (path → content). Timestamps
/// are zeroed so identical inputs produce identical archives.
fn build_ustar(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, String> {
    let mut archive = Vec::new();
    for (path, content) in entries {
        let name = path.trim_start_matches('/');
        if name.is_empty() {
            return Err("archive entry path cannot be empty".to_string());
        }
        if name.len() > 100 {
            return Err(format!("archive entry path '{name}' exceeds 100 bytes"));
        }
        archive.extend_from_slice(&ustar_header(name, content.len()));
        archive.extend_from_slice(content);
        // Pad content to a block boundary.
        let remainder = content.len() % BLOCK;
        if remainder != 0 {
            archive.extend(std::iter::repeat(0u8).take(BLOCK - remainder));
        }
    }
    // End-of-archive marker: two zero blocks.
    archive.extend(std::iter::repeat(0u8).take(2 * BLOCK));
    Ok(archive)
}

fn ustar_header(name: &str, size: usize) -> [u8; BLOCK] {
    let mut header = [0u8; BLOCK];
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    header[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
    header[136..148].copy_from_slice(b"00000000000\0");
    // Checksum is computed with the checksum field set to spaces.
    header[148..156].copy_from_slice(b"        ");
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    let checksum: u32 = header.iter().map(|b| u32::from(*b)).sum();
    header[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
    header
}
