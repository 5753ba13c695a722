/// Kubernetes operations through kubectl
pub mod kubectl;
pub mod readiness;
pub mod resources;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use kubectl::Kubectl;
pub use readiness::{ReadinessPoller, ReadinessTrace};
pub use resources::{Creation, ResourceManager};

/// Workload kinds that support `kubectl rollout status`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Deployment,
    #[value(name = "daemonset")]
    DaemonSet,
    #[value(name = "statefulset")]
    StatefulSet,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named workload, optionally pinned to a namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: &str, namespace: Option<&str>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    /// `kind/name` as kubectl expects it
    pub fn target(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// The pinned namespace, or `default` when none is set
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} in {}", self.target(), ns),
            None => f.write_str(&self.target()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ref_display() {
        let r = ResourceRef::new(ResourceKind::DaemonSet, "ztunnel", Some("istio-system"));
        assert_eq!(r.target(), "daemonset/ztunnel");
        assert_eq!(r.to_string(), "daemonset/ztunnel in istio-system");
        assert_eq!(r.namespace_or("agents"), "istio-system");

        let r = ResourceRef::new(ResourceKind::Deployment, "web", None);
        assert_eq!(r.namespace_or("agents"), "agents");
    }

    #[test]
    fn test_resource_kind_serde() {
        let r: ResourceRef = serde_yaml::from_str("kind: statefulset\nname: db\n").unwrap();
        assert_eq!(r.kind, ResourceKind::StatefulSet);

        let r: ResourceRef = serde_yaml::from_str("name: web\n").unwrap();
        assert_eq!(r.kind, ResourceKind::Deployment);
    }
}
