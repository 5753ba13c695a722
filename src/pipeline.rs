/// Provisioning pipeline
///
/// The environment is built by a fixed sequence of steps. Each step either
/// completes or aborts the run; nothing is rolled back. A failed run is
/// recovered by fixing the cause and rerunning, optionally resuming at the
/// failed step with `up --from <step>`. Credentials are always validated
/// first, whatever step the run resumes at.
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

use crate::config::{Credentials, EnvSource, Playbook, REQUIRED_VARS};
use crate::k8s::{Kubectl, ReadinessTrace};
use crate::kind::{ImagePreloader, KindCluster};
use crate::mesh::helm::Helm;
use crate::mesh::{AddonInstaller, MeshManager};
use crate::utils::command::CommandRunner;
use crate::workloads::WorkloadDeployer;

/// Pipeline steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Step {
    Validate,
    ProvisionInfra,
    LoadImages,
    InstallMesh,
    InstallAddons,
    CreateSecrets,
    DeployWorkloads,
    InstallRoutes,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Validate,
        Step::ProvisionInfra,
        Step::LoadImages,
        Step::InstallMesh,
        Step::InstallAddons,
        Step::CreateSecrets,
        Step::DeployWorkloads,
        Step::InstallRoutes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Validate => "validate",
            Step::ProvisionInfra => "provision-infra",
            Step::LoadImages => "load-images",
            Step::InstallMesh => "install-mesh",
            Step::InstallAddons => "install-addons",
            Step::CreateSecrets => "create-secrets",
            Step::DeployWorkloads => "deploy-workloads",
            Step::InstallRoutes => "install-routes",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context attached to every step error, naming the step that failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("step {step} failed")]
pub struct StepFailure {
    pub step: Step,
}

/// Timing of one executed step
#[derive(Debug, Clone)]
pub struct StepTiming {
    pub step: Step,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub succeeded: bool,
}

/// What a pipeline run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub steps: Vec<StepTiming>,
    /// Readiness traces of the deployed workloads, in deployment order
    pub workloads: Vec<ReadinessTrace>,
}

impl RunReport {
    /// Steps that were executed, in order
    #[cfg(test)]
    pub fn executed(&self) -> Vec<Step> {
        self.steps.iter().map(|t| t.step).collect()
    }

    pub fn log(&self) {
        info!("Run summary:");
        for timing in &self.steps {
            let marker = if timing.succeeded { "✓" } else { "✗" };
            info!(
                "  {} {:<17} started {}  took {:.1}s",
                marker,
                timing.step.as_str(),
                timing.started_at.format("%H:%M:%S"),
                timing.elapsed.as_secs_f64()
            );
        }
    }
}

/// Check that every external tool is installed
pub async fn check_prerequisites(runner: &dyn CommandRunner) -> Result<()> {
    ImagePreloader::check_docker_installed(runner)
        .await
        .context("docker is required")?;
    KindCluster::check_installed(runner)
        .await
        .context("kind is required")?;
    Kubectl::check_installed(runner)
        .await
        .context("kubectl is required")?;
    Helm::check_installed(runner)
        .await
        .context("helm is required")?;

    info!("✓ docker, kind, kubectl and helm are installed");
    Ok(())
}

/// Sequential provisioning pipeline
pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    playbook: &'a Playbook,
    env: &'a EnvSource,
    output_dir: &'a Path,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        playbook: &'a Playbook,
        env: &'a EnvSource,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            runner,
            playbook,
            env,
            output_dir,
        }
    }

    /// Validate credentials, then tool prerequisites
    ///
    /// Credentials are checked first so a missing variable aborts the run
    /// before any external command is executed.
    pub async fn validate(&self) -> Result<Credentials> {
        info!("Validating environment...");
        let credentials = Credentials::from_source(self.env, &REQUIRED_VARS)?;
        check_prerequisites(self.runner).await?;
        Ok(credentials)
    }

    /// Load the playbook images into an existing cluster
    pub async fn preload(&self) -> Result<usize> {
        Credentials::from_source(self.env, &REQUIRED_VARS)?;
        ImagePreloader::check_docker_installed(self.runner)
            .await
            .context("docker is required")?;
        KindCluster::check_installed(self.runner)
            .await
            .context("kind is required")?;

        if !KindCluster::new(self.runner, &self.playbook.cluster).exists().await? {
            anyhow::bail!(
                "kind cluster {} does not exist. Run `agentbed up` first.",
                self.playbook.cluster.name
            );
        }

        ImagePreloader::new(self.runner, &self.playbook.cluster.name)
            .preload(&self.playbook.images)
            .await
    }

    /// Delete the kind cluster
    pub async fn teardown(&self) -> Result<()> {
        Credentials::from_source(self.env, &REQUIRED_VARS)?;
        KindCluster::check_installed(self.runner)
            .await
            .context("kind is required")?;
        KindCluster::new(self.runner, &self.playbook.cluster)
            .delete()
            .await
    }

    /// Run every step starting at `from`
    pub async fn run(&self, from: Step) -> Result<RunReport> {
        let mut report = RunReport::default();
        let result = self.run_steps(from, &mut report).await;
        report.log();
        result.map(|_| report)
    }

    async fn run_steps(&self, from: Step, report: &mut RunReport) -> Result<()> {
        let credentials = timed(report, Step::Validate, self.validate()).await?;

        let cluster = KindCluster::new(self.runner, &self.playbook.cluster);
        let context = cluster.context_name();
        let kubeconfig = self.playbook.cluster.kubeconfig.clone();
        let kubectl = Kubectl::new(self.runner, Some(context.clone()), kubeconfig.clone());

        for step in Step::ALL.into_iter().filter(|s| *s != Step::Validate) {
            if step < from {
                info!("Skipping {} (resuming at {})", step, from);
                continue;
            }

            match step {
                Step::Validate => {}
                Step::ProvisionInfra => {
                    timed(report, step, cluster.ensure(self.output_dir)).await?;
                }
                Step::LoadImages => {
                    let preloader = ImagePreloader::new(self.runner, &self.playbook.cluster.name);
                    timed(report, step, preloader.preload(&self.playbook.images)).await?;
                }
                Step::InstallMesh => {
                    let helm = Helm::new(self.runner, Some(context.clone()), kubeconfig.clone());
                    let mesh = MeshManager::new(self.playbook, &kubectl, helm);
                    timed(report, step, mesh.install()).await?;
                }
                Step::InstallAddons => {
                    let addons = AddonInstaller::new(self.playbook, &kubectl);
                    timed(report, step, addons.install()).await?;
                }
                Step::CreateSecrets => {
                    let deployer = WorkloadDeployer::new(self.playbook, &credentials, &kubectl);
                    timed(report, step, deployer.create_secrets()).await?;
                }
                Step::DeployWorkloads => {
                    let deployer = WorkloadDeployer::new(self.playbook, &credentials, &kubectl);
                    let traces = timed(report, step, deployer.deploy()).await?;
                    report.workloads = traces;
                }
                Step::InstallRoutes => {
                    let deployer = WorkloadDeployer::new(self.playbook, &credentials, &kubectl);
                    timed(report, step, deployer.install_routes()).await?;
                }
            }
        }

        info!("✓ Environment {} is ready", self.playbook.cluster.name);
        Ok(())
    }
}

/// Run one step, recording its timing and attributing any failure to it
async fn timed<T, F>(report: &mut RunReport, step: Step, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!("==> {}", step);
    let started_at = Local::now();
    let clock = Instant::now();

    let result = work.await.context(StepFailure { step });

    report.steps.push(StepTiming {
        step,
        started_at,
        elapsed: clock.elapsed(),
        succeeded: result.is_ok(),
    });
    result
}
