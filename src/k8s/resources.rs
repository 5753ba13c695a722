/// Idempotent resource creation and manifest application
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::info;

use super::Kubectl;
use crate::config::ManifestSource;

/// Outcome of a create-if-absent operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creation {
    Created,
    Skipped,
}

/// Resource management on top of kubectl
pub struct ResourceManager<'a> {
    kubectl: &'a Kubectl<'a>,
}

impl<'a> ResourceManager<'a> {
    pub fn new(kubectl: &'a Kubectl<'a>) -> Self {
        Self { kubectl }
    }

    /// Create an opaque secret holding one key, unless one with this name exists
    ///
    /// An existing secret is never overwritten. The value travels on stdin,
    /// never on the command line.
    pub async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<Creation> {
        if self.kubectl.exists(Some(namespace), "secret", name).await? {
            info!(
                "Secret {} already exists in {}, skipping (delete it to rotate the value)",
                name, namespace
            );
            return Ok(Creation::Skipped);
        }

        let manifest = secret_manifest(namespace, name, key, value);
        self.kubectl
            .create_stdin(Some(namespace), manifest.to_string())
            .await
            .with_context(|| format!("Failed to create secret {}", name))?;

        info!("✓ Created secret {} in {}", name, namespace);
        Ok(Creation::Created)
    }

    /// Create a namespace if it is missing, then apply labels
    pub async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Creation> {
        let creation = if self.kubectl.exists(None, "namespace", name).await? {
            info!("Namespace {} already exists", name);
            Creation::Skipped
        } else {
            self.kubectl.create_namespace(name).await?;
            info!("✓ Created namespace {}", name);
            Creation::Created
        };

        self.kubectl.label_namespace(name, labels).await?;
        Ok(creation)
    }

    /// Apply a manifest file or URL
    pub async fn apply_manifest(
        &self,
        namespace: Option<&str>,
        source: &ManifestSource,
    ) -> Result<()> {
        info!("Applying Kubernetes manifest: {}", source.as_arg());

        let stdout = self.kubectl.apply(namespace, source).await?;
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!("  {}", line.trim());
        }

        Ok(())
    }
}

/// Opaque secret manifest with base64-encoded data
fn secret_manifest(namespace: &str, name: &str, key: &str, value: &str) -> serde_json::Value {
    let mut data = serde_json::Map::new();
    data.insert(key.to_string(), STANDARD.encode(value).into());

    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": name,
            "namespace": namespace,
        },
        "data": data,
    })
}
