/// Helm CLI wrapper
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::utils::command::{check_tool_installed, CommandBuilder, CommandRunner};

/// A chart release to install or upgrade
pub struct Release<'r> {
    pub name: &'r str,
    pub chart: String,
    pub namespace: &'r str,
    pub version: &'r str,
    pub values: &'r BTreeMap<String, String>,
}

pub struct Helm<'a> {
    runner: &'a dyn CommandRunner,
    kube_context: Option<String>,
    kubeconfig: Option<PathBuf>,
}

impl<'a> Helm<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        kube_context: Option<String>,
        kubeconfig: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            kube_context,
            kubeconfig,
        }
    }

    /// Check if helm is installed
    pub async fn check_installed(runner: &dyn CommandRunner) -> Result<()> {
        check_tool_installed(
            runner,
            "helm",
            &["version"],
            "https://helm.sh/docs/intro/install/",
        )
        .await
    }

    fn command(&self) -> CommandBuilder {
        let builder = CommandBuilder::new("helm");
        match &self.kubeconfig {
            Some(path) => builder.kubeconfig(path),
            None => builder,
        }
    }

    /// Add a chart repository and refresh the index
    pub async fn add_repo(&self, name: &str, url: &str) -> Result<()> {
        info!("Adding Helm repository {} ({})...", name, url);

        let output = self
            .command()
            .args(["repo", "add", name, url])
            .context(format!("Failed to add Helm repo {}", name))
            .output(self.runner)
            .await?;

        if !output.success {
            // Ignore "already exists" errors
            if !output.stderr.contains("already exists") {
                output
                    .into_result()
                    .with_context(|| format!("Failed to add Helm repo {}", name))?;
            }
        }

        self.command()
            .args(["repo", "update", name])
            .context("Failed to update Helm repos")
            .run_silent(self.runner)
            .await
    }

    /// `helm upgrade --install`, safe to repeat
    pub async fn upgrade_install(&self, release: &Release<'_>) -> Result<()> {
        info!(
            "Installing Helm chart {} as {} in {}...",
            release.chart, release.name, release.namespace
        );

        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            release.name.to_string(),
            release.chart.clone(),
            "--namespace".to_string(),
            release.namespace.to_string(),
            "--create-namespace".to_string(),
            "--version".to_string(),
            release.version.to_string(),
        ];
        for (key, value) in release.values {
            args.push("--set".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(context) = &self.kube_context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }

        self.command()
            .args(args)
            .context(format!("Failed to install Helm chart {}", release.chart))
            .run_silent(self.runner)
            .await
    }
}
