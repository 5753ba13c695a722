/// Observability add-ons (Prometheus, Kiali, ...)
use anyhow::{Context, Result};
use tracing::info;

use crate::config::Playbook;
use crate::k8s::{Kubectl, ReadinessPoller, ResourceManager};

pub struct AddonInstaller<'a> {
    playbook: &'a Playbook,
    kubectl: &'a Kubectl<'a>,
}

impl<'a> AddonInstaller<'a> {
    pub fn new(playbook: &'a Playbook, kubectl: &'a Kubectl<'a>) -> Self {
        Self { playbook, kubectl }
    }

    /// Apply each add-on manifest and wait for its workloads
    pub async fn install(&self) -> Result<usize> {
        let resources = ResourceManager::new(self.kubectl);
        let poller = ReadinessPoller::new(self.kubectl, &self.playbook.polling);

        for addon in &self.playbook.addons {
            info!("Installing add-on {}...", addon.name);
            let source = self.playbook.resolve_manifest(&addon.manifest)?;
            resources
                .apply_manifest(None, &source)
                .await
                .with_context(|| format!("Failed to install add-on {}", addon.name))?;

            for resource in &addon.wait_for {
                poller
                    .wait(&self.playbook.mesh.namespace, resource)
                    .await?;
            }
            info!("✓ Add-on {} installed", addon.name);
        }

        Ok(self.playbook.addons.len())
    }
}
