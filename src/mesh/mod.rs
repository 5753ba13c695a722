/// Service mesh installation (Istio ambient: base, istiod, CNI, ztunnel)
pub mod addons;
pub mod helm;

use anyhow::Result;
use tracing::info;

use crate::config::{MeshSpec, Playbook};
use crate::k8s::{Creation, Kubectl, ReadinessPoller, ResourceManager};
use helm::{Helm, Release};

pub use addons::AddonInstaller;

/// Mesh deployment manager
pub struct MeshManager<'a> {
    spec: &'a MeshSpec,
    playbook: &'a Playbook,
    kubectl: &'a Kubectl<'a>,
    helm: Helm<'a>,
}

impl<'a> MeshManager<'a> {
    pub fn new(playbook: &'a Playbook, kubectl: &'a Kubectl<'a>, helm: Helm<'a>) -> Self {
        Self {
            spec: &playbook.mesh,
            playbook,
            kubectl,
            helm,
        }
    }

    /// Install the mesh and enroll the workload namespace
    pub async fn install(&self) -> Result<()> {
        info!("Installing service mesh version {}...", self.spec.version);

        // Gateway API CRDs first, the mesh controllers watch them
        self.install_gateway_api_crds().await?;

        self.helm
            .add_repo(&self.spec.repo_name, &self.spec.repo_url)
            .await?;

        for chart in &self.spec.charts {
            self.helm
                .upgrade_install(&Release {
                    name: &chart.release,
                    chart: format!("{}/{}", self.spec.repo_name, chart.chart),
                    namespace: &self.spec.namespace,
                    version: &self.spec.version,
                    values: &chart.values,
                })
                .await?;

            let poller = ReadinessPoller::new(self.kubectl, &self.playbook.polling);
            for resource in &chart.wait_for {
                poller.wait(&self.spec.namespace, resource).await?;
            }
        }

        self.enroll_namespace().await?;

        info!("✓ Service mesh installed");
        Ok(())
    }

    /// Install Gateway API CRDs
    async fn install_gateway_api_crds(&self) -> Result<()> {
        let Some(crds) = &self.spec.gateway_api_crds else {
            return Ok(());
        };

        info!("Installing Gateway API CRDs...");
        let source = self.playbook.resolve_manifest(crds)?;
        ResourceManager::new(self.kubectl)
            .apply_manifest(None, &source)
            .await
    }

    /// Create the workload namespace and label it for the mesh data plane
    async fn enroll_namespace(&self) -> Result<Creation> {
        ResourceManager::new(self.kubectl)
            .ensure_namespace(&self.playbook.namespace, &self.spec.namespace_labels)
            .await
    }
}
