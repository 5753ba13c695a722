/// kubectl wrapper
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::ManifestSource;
use crate::utils::command::{check_tool_installed, CommandBuilder, CommandRunner};

/// kubectl bound to one cluster context
pub struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    context: Option<String>,
    kubeconfig: Option<PathBuf>,
}

/// Replica counts of a deployment as reported by the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub name: String,
    pub desired: i32,
    pub ready: i32,
    pub available: i32,
}

impl DeploymentStatus {
    pub fn is_ready(&self) -> bool {
        self.ready >= self.desired && self.available >= self.desired
    }
}

#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct DeploymentItem {
    metadata: ItemMetadata,
    #[serde(default)]
    spec: DeploymentItemSpec,
    #[serde(default)]
    status: DeploymentItemStatus,
}

#[derive(Deserialize)]
struct ItemMetadata {
    name: String,
}

#[derive(Deserialize)]
struct DeploymentItemSpec {
    #[serde(default = "one_replica")]
    replicas: i32,
}

impl Default for DeploymentItemSpec {
    fn default() -> Self {
        Self {
            replicas: one_replica(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeploymentItemStatus {
    #[serde(default)]
    ready_replicas: i32,
    #[serde(default)]
    available_replicas: i32,
}

fn one_replica() -> i32 {
    1
}

impl<'a> Kubectl<'a> {
    /// Create a kubectl wrapper
    pub fn new(
        runner: &'a dyn CommandRunner,
        context: Option<String>,
        kubeconfig: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            context,
            kubeconfig,
        }
    }

    /// Check if kubectl is installed
    pub async fn check_installed(runner: &dyn CommandRunner) -> Result<()> {
        check_tool_installed(
            runner,
            "kubectl",
            &["version", "--client"],
            "https://kubernetes.io/docs/tasks/tools/",
        )
        .await
    }

    /// Build a kubectl command; the context flag goes after the subcommand
    fn command<I, S>(&self, args: I) -> CommandBuilder
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut builder = CommandBuilder::new("kubectl").args(args);
        if let Some(context) = &self.context {
            builder = builder.args(["--context", context.as_str()]);
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            builder = builder.kubeconfig(kubeconfig);
        }
        builder
    }

    /// Whether a named resource exists
    ///
    /// Uses `--ignore-not-found`, so a missing resource is an empty answer
    /// while an unreachable cluster is still an error.
    pub async fn exists(&self, namespace: Option<&str>, kind: &str, name: &str) -> Result<bool> {
        let mut args = vec!["get", kind, name];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        args.extend(["--ignore-not-found", "-o", "name"]);

        let stdout = self
            .command(args)
            .context(format!("Failed to look up {}/{}", kind, name))
            .run(self.runner)
            .await?;

        Ok(!stdout.trim().is_empty())
    }

    /// Block until the rollout of `kind/name` finishes or times out
    pub async fn rollout_status(&self, namespace: &str, target: &str, timeout: &str) -> Result<()> {
        let timeout_arg = format!("--timeout={}", timeout);
        self.command(["rollout", "status", target, "-n", namespace, timeout_arg.as_str()])
            .context(format!("Rollout of {} did not complete", target))
            .run_silent(self.runner)
            .await
    }

    /// `kubectl apply -f` a URL or file
    pub async fn apply(&self, namespace: Option<&str>, source: &ManifestSource) -> Result<String> {
        let source_arg = source.as_arg();
        let mut args = vec!["apply".to_string(), "-f".to_string(), source_arg.clone()];
        if let Some(ns) = namespace {
            args.extend(["-n".to_string(), ns.to_string()]);
        }

        self.command(args)
            .context(format!("Failed to apply {}", source_arg))
            .run(self.runner)
            .await
    }

    /// `kubectl apply -f -` with the manifest on stdin
    pub async fn apply_stdin(&self, namespace: Option<&str>, manifest: String) -> Result<String> {
        let mut args = vec!["apply", "-f", "-"];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }

        self.command(args)
            .stdin(manifest)
            .context("Failed to apply manifest")
            .run(self.runner)
            .await
    }

    /// `kubectl create -f -` with the manifest on stdin; fails if it exists
    pub async fn create_stdin(&self, namespace: Option<&str>, manifest: String) -> Result<()> {
        let mut args = vec!["create", "-f", "-"];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }

        self.command(args)
            .stdin(manifest)
            .context("Failed to create resource")
            .run_silent(self.runner)
            .await
    }

    /// Create a namespace
    pub async fn create_namespace(&self, name: &str) -> Result<()> {
        self.command(["create", "namespace", name])
            .context(format!("Failed to create namespace {}", name))
            .run_silent(self.runner)
            .await
    }

    /// Set labels on a namespace, replacing existing values
    pub async fn label_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }

        let mut args = vec!["label".to_string(), "namespace".to_string(), name.to_string()];
        args.extend(labels.iter().map(|(k, v)| format!("{}={}", k, v)));
        args.push("--overwrite".to_string());

        self.command(args)
            .context(format!("Failed to label namespace {}", name))
            .run_silent(self.runner)
            .await
    }

    /// Replica status of every deployment in a namespace
    pub async fn deployments(&self, namespace: &str) -> Result<Vec<DeploymentStatus>> {
        let stdout = self
            .command(["get", "deployments", "-n", namespace, "-o", "json"])
            .context(format!("Failed to list deployments in {}", namespace))
            .run(self.runner)
            .await?;

        parse_deployments(&stdout)
    }
}

/// Parse `kubectl get deployments -o json`
fn parse_deployments(json: &str) -> Result<Vec<DeploymentStatus>> {
    let list: ItemList<DeploymentItem> =
        serde_json::from_str(json).context("Failed to parse deployment list")?;

    Ok(list
        .items
        .into_iter()
        .map(|item| DeploymentStatus {
            name: item.metadata.name,
            desired: item.spec.replicas,
            ready: item.status.ready_replicas,
            available: item.status.available_replicas,
        })
        .collect())
}
