/// Secrets, agent/tool workloads and gateway routes
use anyhow::{Context, Result};
use tracing::info;

use crate::config::{Credentials, Playbook, WorkloadSpec};
use crate::error::ProvisionError;
use crate::k8s::{Creation, Kubectl, ReadinessPoller, ReadinessTrace, ResourceManager, ResourceRef};
use crate::utils::template;

/// Deploys everything that lives in the workload namespace
pub struct WorkloadDeployer<'a> {
    playbook: &'a Playbook,
    credentials: &'a Credentials,
    kubectl: &'a Kubectl<'a>,
}

impl<'a> WorkloadDeployer<'a> {
    pub fn new(playbook: &'a Playbook, credentials: &'a Credentials, kubectl: &'a Kubectl<'a>) -> Self {
        Self {
            playbook,
            credentials,
            kubectl,
        }
    }

    /// Create every credential-backed secret that does not exist yet
    pub async fn create_secrets(&self) -> Result<Vec<Creation>> {
        let resources = ResourceManager::new(self.kubectl);
        let mut outcomes = Vec::with_capacity(self.playbook.secrets.len());

        for secret in &self.playbook.secrets {
            let value = self
                .credentials
                .get(&secret.from)
                .ok_or_else(|| ProvisionError::MissingCredentials(vec![secret.from.clone()]))?;

            let creation = resources
                .ensure_secret(&self.playbook.namespace, &secret.name, &secret.key, value)
                .await?;
            outcomes.push(creation);
        }

        Ok(outcomes)
    }

    /// Render a workload template with the credential variables
    pub async fn render(&self, workload: &WorkloadSpec) -> Result<String> {
        let path = self.playbook.resolve_path(&workload.template);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read template {}", path.display()))?;

        let rendered = template::substitute(&content, &self.credentials.template_vars());
        if !rendered.unresolved.is_empty() {
            return Err(ProvisionError::Template {
                template: path.display().to_string(),
                names: rendered.unresolved,
            }
            .into());
        }

        Ok(rendered.text)
    }

    /// Apply each workload in order and wait for it before the next one
    pub async fn deploy(&self) -> Result<Vec<ReadinessTrace>> {
        let namespace = self.playbook.namespace.as_str();
        let poller = ReadinessPoller::new(self.kubectl, &self.playbook.polling);
        let mut traces = Vec::with_capacity(self.playbook.workloads.len());

        info!(
            "Deploying {} workloads for {} into {}",
            self.playbook.workloads.len(),
            self.credentials.repo_user(),
            namespace
        );

        for workload in &self.playbook.workloads {
            let manifest = self.render(workload).await?;
            let stdout = self
                .kubectl
                .apply_stdin(Some(namespace), manifest)
                .await
                .with_context(|| format!("Failed to deploy {}", workload.name))?;
            for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
                info!("  {}", line.trim());
            }

            let resource = ResourceRef::new(workload.kind, &workload.name, None);
            traces.push(poller.wait(namespace, &resource).await?);
        }

        info!("✓ All {} workloads are Ready", traces.len());
        Ok(traces)
    }

    /// Apply gateway, route and service entry manifests
    pub async fn install_routes(&self) -> Result<usize> {
        let resources = ResourceManager::new(self.kubectl);

        for route in &self.playbook.routes {
            let source = self.playbook.resolve_manifest(route)?;
            resources
                .apply_manifest(Some(&self.playbook.namespace), &source)
                .await?;
        }

        info!("✓ Applied {} route manifests", self.playbook.routes.len());
        Ok(self.playbook.routes.len())
    }
}
