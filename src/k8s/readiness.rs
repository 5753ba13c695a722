/// Readiness polling for workloads
///
/// A workload is first polled for existence on a fixed interval. Once it
/// exists, the wait is handed to `kubectl rollout status`, which blocks until
/// the replicas are healthy or its own timeout fires.
use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info};

use super::{Kubectl, ResourceRef};
use crate::config::PollingSpec;

/// Observed lifecycle of a polled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Absent,
    /// Exists, rollout not finished yet
    Pending,
    Ready,
    Failed,
}

/// What a completed wait observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTrace {
    pub resource: String,
    pub existence_checks: u32,
    pub transitions: Vec<Readiness>,
}

pub struct ReadinessPoller<'a> {
    kubectl: &'a Kubectl<'a>,
    polling: &'a PollingSpec,
}

impl<'a> ReadinessPoller<'a> {
    pub fn new(kubectl: &'a Kubectl<'a>, polling: &'a PollingSpec) -> Self {
        Self { kubectl, polling }
    }

    /// Wait until `resource` exists and its rollout has finished
    pub async fn wait(&self, default_namespace: &str, resource: &ResourceRef) -> Result<ReadinessTrace> {
        let namespace = resource.namespace_or(default_namespace);
        let subject = format!("{} in {}", resource.target(), namespace);
        let mut transitions = vec![Readiness::Absent];

        let checks = AtomicU32::new(0);
        let checks_ref = &checks;
        let kubectl = self.kubectl;
        let kind = resource.kind.as_str();
        let name = resource.name.as_str();

        self.polling
            .polling_config(subject.clone())
            .poll_until(move || async move {
                checks_ref.fetch_add(1, Ordering::SeqCst);
                kubectl.exists(Some(namespace), kind, name).await
            })
            .await?;
        transitions.push(Readiness::Pending);

        info!("{} exists, waiting for rollout...", subject);
        if let Err(e) = self
            .kubectl
            .rollout_status(namespace, &resource.target(), &self.polling.rollout_timeout)
            .await
        {
            error!("✗ {} is {:?}", subject, Readiness::Failed);
            return Err(e);
        }
        transitions.push(Readiness::Ready);
        info!("✓ {} is Ready", subject);

        Ok(ReadinessTrace {
            resource: subject,
            existence_checks: checks.load(Ordering::SeqCst),
            transitions,
        })
    }
}
