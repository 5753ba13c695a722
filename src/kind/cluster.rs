/// kind cluster lifecycle
use anyhow::{Context, Result};
use handlebars::Handlebars;
use std::path::Path;
use tracing::info;

use crate::config::ClusterSpec;
use crate::k8s::Creation;
use crate::utils::command::{check_tool_installed, CommandBuilder, CommandRunner};

const KIND_CONFIG_TEMPLATE: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
name: {{name}}
nodes:
  - role: control-plane
{{#if node_image}}    image: {{node_image}}
{{/if}}{{#if port_mappings}}    extraPortMappings:
{{#each port_mappings}}      - containerPort: {{container_port}}
        hostPort: {{host_port}}
        protocol: TCP
{{/each}}{{/if}}{{#each workers}}  - role: worker
{{#if @root.node_image}}    image: {{@root.node_image}}
{{/if}}{{/each}}
"#;

/// kind cluster manager
pub struct KindCluster<'a> {
    runner: &'a dyn CommandRunner,
    spec: &'a ClusterSpec,
}

impl<'a> KindCluster<'a> {
    pub fn new(runner: &'a dyn CommandRunner, spec: &'a ClusterSpec) -> Self {
        Self { runner, spec }
    }

    /// Check if kind is installed
    pub async fn check_installed(runner: &dyn CommandRunner) -> Result<()> {
        check_tool_installed(
            runner,
            "kind",
            &["version"],
            "https://kind.sigs.k8s.io/docs/user/quick-start/#installation",
        )
        .await
    }

    /// kubectl context kind creates for this cluster
    pub fn context_name(&self) -> String {
        format!("kind-{}", self.spec.name)
    }

    /// Whether a cluster with this name exists
    pub async fn exists(&self) -> Result<bool> {
        let stdout = CommandBuilder::new("kind")
            .args(["get", "clusters"])
            .context("Failed to list kind clusters")
            .run(self.runner)
            .await?;

        Ok(stdout.lines().any(|line| line.trim() == self.spec.name))
    }

    /// Create the cluster unless it already exists
    ///
    /// The rendered kind config is written to `output_dir/kind-config.yaml`.
    pub async fn ensure(&self, output_dir: &Path) -> Result<Creation> {
        if self.exists().await? {
            info!("kind cluster {} already exists, skipping creation", self.spec.name);
            return Ok(Creation::Skipped);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .context("Failed to create output directory")?;
        let config_path = output_dir.join("kind-config.yaml");
        tokio::fs::write(&config_path, self.render_config()?)
            .await
            .context("Failed to write kind config")?;

        info!("Creating kind cluster {}...", self.spec.name);
        CommandBuilder::new("kind")
            .args(["create", "cluster", "--name", self.spec.name.as_str(), "--config"])
            .arg(&config_path)
            .args(["--wait", "120s"])
            .context(format!("Failed to create kind cluster {}", self.spec.name))
            .run_silent(self.runner)
            .await?;

        info!("✓ kind cluster {} created", self.spec.name);
        Ok(Creation::Created)
    }

    /// Delete the cluster; a missing cluster is not an error
    pub async fn delete(&self) -> Result<()> {
        info!("Deleting kind cluster {}...", self.spec.name);

        CommandBuilder::new("kind")
            .args(["delete", "cluster", "--name", self.spec.name.as_str()])
            .context(format!("Failed to delete kind cluster {}", self.spec.name))
            .run_silent(self.runner)
            .await?;

        info!("✓ kind cluster {} deleted", self.spec.name);
        Ok(())
    }

    /// Render the kind cluster config
    pub fn render_config(&self) -> Result<String> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        let data = serde_json::json!({
            "name": self.spec.name,
            "node_image": self.spec.node_image,
            "port_mappings": self.spec.port_mappings,
            "workers": (0..self.spec.workers).collect::<Vec<u32>>(),
        });

        registry
            .render_template(KIND_CONFIG_TEMPLATE, &data)
            .context("Failed to render kind config")
    }
}
