/// agentbed - local agent demo environments
///
/// Provisions a kind cluster with the Istio ambient mesh, observability
/// add-ons, credential-backed secrets and a set of agent and tool workloads,
/// then exposes them through the Gateway API.
mod config;
mod error;
#[cfg(test)]
mod fixture;
mod k8s;
mod kind;
mod mesh;
mod pipeline;
mod utils;
mod workloads;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{EnvSource, Playbook, REQUIRED_VARS};
use crate::error::exit_code_for;
use crate::k8s::{Kubectl, ReadinessPoller, ResourceKind, ResourceRef};
use crate::kind::KindCluster;
use crate::pipeline::{Pipeline, Step};
use crate::utils::command::SystemRunner;

#[derive(Parser)]
#[command(name = "agentbed")]
#[command(about = "Provision a local kind cluster with Istio ambient and AI agent workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Playbook file path
    #[arg(short, long, global = true, default_value = "playbook.yaml")]
    config: PathBuf,

    /// Env file with TOKEN, REPO_USER and OPENAI_API_KEY
    #[arg(short, long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Output directory for generated files
    #[arg(short, long, global = true, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the whole environment
    Up {
        /// Resume at this step (credentials are always validated)
        #[arg(long, value_enum, default_value_t = Step::Validate)]
        from: Step,
    },

    /// Validate credentials and required tools
    Check,

    /// Pull images and load them into the cluster
    Preload,

    /// Wait for a workload to exist and finish rolling out
    Wait {
        /// Resource name
        name: String,

        #[arg(long, value_enum, default_value_t = ResourceKind::Deployment)]
        kind: ResourceKind,

        /// Namespace (defaults to the playbook namespace)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Show workload deployment status
    Status,

    /// Generate the built-in playbook
    Init,

    /// Delete the kind cluster
    Down,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agentbed={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Execute command
    let result = match cli.command {
        Commands::Up { from } => provision(&cli, from).await,
        Commands::Check => check_environment(&cli).await,
        Commands::Preload => preload_images(&cli).await,
        Commands::Wait {
            ref name,
            kind,
            ref namespace,
        } => wait_for(&cli, ResourceRef::new(kind, name, namespace.as_deref())).await,
        Commands::Status => show_status(&cli).await,
        Commands::Init => init_playbook(&cli).await,
        Commands::Down => teardown(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(exit_code_for(&e));
    }
}

fn load_playbook(cli: &Cli) -> Result<Playbook> {
    Playbook::load_or_default(&cli.config).context("Failed to load playbook")
}

fn kubectl_for<'a>(runner: &'a SystemRunner, playbook: &Playbook) -> Kubectl<'a> {
    Kubectl::new(
        runner,
        Some(KindCluster::new(runner, &playbook.cluster).context_name()),
        playbook.cluster.kubeconfig.clone(),
    )
}

/// Run the provisioning pipeline
async fn provision(cli: &Cli, from: Step) -> Result<()> {
    info!("Starting environment provisioning...");

    let playbook = load_playbook(cli)?;
    let env = EnvSource::load(&cli.env_file, &REQUIRED_VARS)?;
    info!("Cluster name: {}", playbook.cluster.name);

    let runner = SystemRunner;
    let report = Pipeline::new(&runner, &playbook, &env, &cli.output)
        .run(from)
        .await?;

    let context = KindCluster::new(&runner, &playbook.cluster).context_name();
    info!("✓ Environment provisioning completed successfully!");
    info!("");
    info!("Environment details:");
    info!("  Cluster: {}", playbook.cluster.name);
    info!("  Namespace: {}", playbook.namespace);
    info!("  Workloads ready: {}", report.workloads.len());
    for mapping in &playbook.cluster.port_mappings {
        info!("  Gateway: http://localhost:{}", mapping.host_port);
    }
    info!("");
    info!("To access your cluster:");
    info!("  kubectl config use-context {}", context);
    info!("  kubectl get pods -n {}", playbook.namespace);

    Ok(())
}

/// Validate credentials and tools without touching the cluster
async fn check_environment(cli: &Cli) -> Result<()> {
    let playbook = load_playbook(cli)?;
    let env = EnvSource::load(&cli.env_file, &REQUIRED_VARS)?;
    let runner = SystemRunner;

    Pipeline::new(&runner, &playbook, &env, &cli.output)
        .validate()
        .await?;

    info!("✓ Environment is ready for `agentbed up`");
    Ok(())
}

/// Preload images into an existing cluster
async fn preload_images(cli: &Cli) -> Result<()> {
    let playbook = load_playbook(cli)?;
    let env = EnvSource::load(&cli.env_file, &REQUIRED_VARS)?;
    let runner = SystemRunner;

    Pipeline::new(&runner, &playbook, &env, &cli.output)
        .preload()
        .await?;
    Ok(())
}

/// Wait for one resource using the playbook polling policy
async fn wait_for(cli: &Cli, resource: ResourceRef) -> Result<()> {
    let playbook = load_playbook(cli)?;
    let runner = SystemRunner;
    Kubectl::check_installed(&runner)
        .await
        .context("kubectl is required")?;

    let kubectl = kubectl_for(&runner, &playbook);
    let trace = ReadinessPoller::new(&kubectl, &playbook.polling)
        .wait(&playbook.namespace, &resource)
        .await?;

    info!(
        "{} became ready after {} existence checks",
        trace.resource, trace.existence_checks
    );
    Ok(())
}

/// Show workload status
async fn show_status(cli: &Cli) -> Result<()> {
    let playbook = load_playbook(cli)?;
    let runner = SystemRunner;

    let cluster = KindCluster::new(&runner, &playbook.cluster);
    if !cluster.exists().await? {
        info!("kind cluster {} does not exist", playbook.cluster.name);
        return Ok(());
    }

    let kubectl = kubectl_for(&runner, &playbook);
    let deployments = kubectl.deployments(&playbook.namespace).await?;

    info!("Cluster: {}", playbook.cluster.name);
    info!("");
    info!("Deployments in {}:", playbook.namespace);
    if deployments.is_empty() {
        info!("  (none)");
    }
    for deployment in &deployments {
        let marker = if deployment.is_ready() { "✓" } else { "…" };
        info!(
            "  {} {} ({}/{} ready, {} available)",
            marker, deployment.name, deployment.ready, deployment.desired, deployment.available
        );
    }

    let missing: Vec<&str> = playbook
        .workloads
        .iter()
        .filter(|w| w.kind == ResourceKind::Deployment)
        .map(|w| w.name.as_str())
        .filter(|name| !deployments.iter().any(|d| d.name == *name))
        .collect();
    if !missing.is_empty() {
        warn!("Not deployed yet: {}", missing.join(", "));
    }

    Ok(())
}

/// Write the built-in playbook
async fn init_playbook(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!("Playbook already exists: {}", cli.config.display());
    }

    let playbook = Playbook::example();
    let yaml = serde_yaml::to_string(&playbook)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write playbook")?;

    info!("Playbook created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the playbook to match your workloads");
    info!("  2. Create {} with:", cli.env_file.display());
    for var in REQUIRED_VARS {
        info!("     {}=...", var);
    }
    info!("  3. Provision the environment:");
    info!("     agentbed up");

    Ok(())
}

/// Delete the kind cluster
async fn teardown(cli: &Cli) -> Result<()> {
    let playbook = load_playbook(cli)?;
    let env = EnvSource::load(&cli.env_file, &REQUIRED_VARS)?;
    let runner = SystemRunner;

    Pipeline::new(&runner, &playbook, &env, &cli.output)
        .teardown()
        .await
}
