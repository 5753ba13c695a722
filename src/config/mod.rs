/// Playbook configuration for agentbed
///
/// The playbook declares everything the provisioning pipeline does: the kind
/// cluster, images to preload, the mesh charts, add-ons, secrets, workloads
/// and routes. Without a playbook file the built-in `Playbook::example()` is
/// used.
pub mod credentials;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::error::ProvisionError;
use crate::k8s::{ResourceKind, ResourceRef};
use crate::utils::polling::PollingConfig;

pub use credentials::{Credentials, EnvSource, REQUIRED_VARS};

/// Main playbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// kind cluster settings
    pub cluster: ClusterSpec,

    /// Namespace that receives secrets, workloads and routes
    pub namespace: String,

    /// Images pulled and loaded into the cluster before installing anything
    #[serde(default)]
    pub images: ImagesSpec,

    /// Service mesh installation
    pub mesh: MeshSpec,

    /// Observability add-ons applied after the mesh
    #[serde(default)]
    pub addons: Vec<AddonSpec>,

    /// Credential-backed secrets, created only when absent
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,

    /// Workload templates deployed in order
    #[serde(default)]
    pub workloads: Vec<WorkloadSpec>,

    /// Gateway, route and service entry manifests applied last
    #[serde(default)]
    pub routes: Vec<String>,

    /// Readiness polling policy
    #[serde(default)]
    pub polling: PollingSpec,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// kind cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name, also used for `kind load --name`
    pub name: String,

    /// Node image override (e.g., "kindest/node:v1.32.2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image: Option<String>,

    /// Number of worker nodes next to the control plane
    #[serde(default)]
    pub workers: u32,

    /// Host port mappings on the control plane node
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,

    /// Kubeconfig to use instead of the default one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Images to preload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesSpec {
    #[serde(default)]
    pub references: Vec<String>,

    /// How many images may be pulled and loaded at once
    #[serde(default = "default_one")]
    pub concurrency: usize,
}

/// Service mesh installed through Helm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSpec {
    /// Chart version (e.g., "1.26.0")
    pub version: String,

    /// Namespace for mesh components
    #[serde(default = "default_mesh_namespace")]
    pub namespace: String,

    /// Helm repository name and URL
    pub repo_name: String,
    pub repo_url: String,

    /// Gateway API CRD manifest applied before the charts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_api_crds: Option<String>,

    /// Charts installed in order
    pub charts: Vec<ChartSpec>,

    /// Labels set on the workload namespace (e.g., ambient enrollment)
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
}

/// A single Helm chart release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSpec {
    /// Release name
    pub release: String,

    /// Chart name within the repository
    pub chart: String,

    /// `--set` values
    #[serde(default)]
    pub values: BTreeMap<String, String>,

    /// Resources that must be Ready before the next chart
    #[serde(default)]
    pub wait_for: Vec<ResourceRef>,
}

/// Observability add-on applied from a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonSpec {
    pub name: String,

    /// URL or path of the manifest
    pub manifest: String,

    #[serde(default)]
    pub wait_for: Vec<ResourceRef>,
}

/// Secret built from a single credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,

    /// Data key inside the secret
    pub key: String,

    /// Credential variable supplying the value
    pub from: String,
}

/// Workload deployed from a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Name of the resource the template creates
    pub name: String,

    /// Template path, may contain `${REPO_USER}`
    pub template: PathBuf,

    #[serde(default)]
    pub kind: ResourceKind,
}

/// Readiness polling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSpec {
    /// Seconds between existence checks
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Maximum existence checks; unset means poll forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,

    /// Overall limit on existence checks, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Passed to `kubectl rollout status --timeout`
    #[serde(default = "default_rollout_timeout")]
    pub rollout_timeout: String,
}

impl Default for ImagesSpec {
    fn default() -> Self {
        Self {
            references: Vec::new(),
            concurrency: 1,
        }
    }
}

impl Default for PollingSpec {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_attempts: default_max_attempts(),
            timeout_secs: None,
            rollout_timeout: default_rollout_timeout(),
        }
    }
}

impl PollingSpec {
    /// Polling configuration for waiting on one resource
    pub fn polling_config(&self, subject: impl Into<String>) -> PollingConfig {
        PollingConfig::new(Duration::from_secs(self.interval_secs), subject)
            .with_max_attempts(self.max_attempts)
            .with_timeout(self.timeout_secs.map(Duration::from_secs))
    }
}

fn default_one() -> usize {
    1
}

fn default_interval() -> u64 {
    2
}

fn default_max_attempts() -> Option<u32> {
    Some(300)
}

fn default_rollout_timeout() -> String {
    "300s".to_string()
}

fn default_mesh_namespace() -> String {
    "istio-system".to_string()
}

/// Where a manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Remote(Url),
    Local(PathBuf),
}

impl ManifestSource {
    /// Argument for `kubectl apply -f`
    pub fn as_arg(&self) -> String {
        match self {
            ManifestSource::Remote(url) => url.to_string(),
            ManifestSource::Local(path) => path.display().to_string(),
        }
    }
}

impl Playbook {
    /// Load a playbook from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read playbook {}", path.display()))?;
        let mut playbook: Playbook = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse playbook {}", path.display()))?;
        playbook.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        playbook.validate()?;
        Ok(playbook)
    }

    /// Load the playbook file, or the built-in playbook when it is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            info!(
                "Playbook {} not found, using the built-in playbook",
                path.display()
            );
            let playbook = Self::example();
            playbook.validate()?;
            Ok(playbook)
        }
    }

    /// Validate the playbook
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { ProvisionError::InvalidPlaybook(msg).into() };

        if !is_dns_label(&self.cluster.name) {
            return Err(invalid(format!(
                "cluster name '{}' must be a lowercase DNS label",
                self.cluster.name
            )));
        }

        if !is_dns_label(&self.namespace) {
            return Err(invalid(format!(
                "namespace '{}' must be a lowercase DNS label",
                self.namespace
            )));
        }

        if self.images.concurrency == 0 {
            return Err(invalid("images.concurrency must be at least 1".to_string()));
        }

        if self.polling.max_attempts == Some(0) {
            return Err(invalid("polling.max_attempts must be at least 1".to_string()));
        }

        if self.mesh.charts.is_empty() {
            return Err(invalid("mesh.charts cannot be empty".to_string()));
        }

        for secret in &self.secrets {
            if !REQUIRED_VARS.contains(&secret.from.as_str()) {
                return Err(invalid(format!(
                    "secret '{}' reads from '{}', which is not one of {}",
                    secret.name,
                    secret.from,
                    REQUIRED_VARS.join(", ")
                )));
            }
        }

        let mut seen = HashSet::new();
        for workload in &self.workloads {
            if !seen.insert((workload.kind, workload.name.as_str())) {
                return Err(invalid(format!("workload '{}' is declared twice", workload.name)));
            }
        }

        let manifests = self
            .routes
            .iter()
            .chain(self.addons.iter().map(|a| &a.manifest))
            .chain(self.mesh.gateway_api_crds.iter());
        for manifest in manifests {
            self.resolve_manifest(manifest)?;
        }

        Ok(())
    }

    /// Resolve a manifest reference to a URL or a path under `base_dir`
    pub fn resolve_manifest(&self, reference: &str) -> Result<ManifestSource> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            let url = Url::parse(reference).map_err(|e| {
                ProvisionError::InvalidPlaybook(format!("invalid manifest URL '{}': {}", reference, e))
            })?;
            Ok(ManifestSource::Remote(url))
        } else {
            Ok(ManifestSource::Local(self.resolve_path(reference)))
        }
    }

    /// Resolve a relative path against `base_dir`
    pub fn resolve_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// The built-in playbook
    pub fn example() -> Self {
        let mesh_ns = default_mesh_namespace();
        let version = "1.26.0".to_string();
        let ambient = |extra: &[(&str, &str)]| -> BTreeMap<String, String> {
            std::iter::once(("profile", "ambient"))
                .chain(extra.iter().copied())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        let workloads = [
            "a2a-currency-agent",
            "a2a-contact-extractor-agent",
            "acp-ollama-researcher",
            "mcp-get-weather",
            "mcp-web-fetch",
            "acp-weather-service",
        ]
        .into_iter()
        .map(|name| WorkloadSpec {
            name: name.to_string(),
            template: PathBuf::from(format!("manifests/workloads/{}.yaml", name)),
            kind: ResourceKind::Deployment,
        })
        .collect();

        Self {
            cluster: ClusterSpec {
                name: "agent-platform".to_string(),
                node_image: None,
                workers: 0,
                port_mappings: vec![PortMapping {
                    container_port: 30080,
                    host_port: 8080,
                }],
                kubeconfig: None,
            },
            namespace: "agents".to_string(),
            images: ImagesSpec {
                references: ["pilot", "proxyv2", "install-cni", "ztunnel"]
                    .iter()
                    .map(|image| format!("docker.io/istio/{}:{}", image, version))
                    .collect(),
                concurrency: 1,
            },
            mesh: MeshSpec {
                version: version.clone(),
                namespace: mesh_ns.clone(),
                repo_name: "istio".to_string(),
                repo_url: "https://istio-release.storage.googleapis.com/charts".to_string(),
                gateway_api_crds: Some(
                    "https://github.com/kubernetes-sigs/gateway-api/releases/download/v1.3.0/standard-install.yaml"
                        .to_string(),
                ),
                charts: vec![
                    ChartSpec {
                        release: "istio-base".to_string(),
                        chart: "base".to_string(),
                        values: BTreeMap::from([(
                            "defaultRevision".to_string(),
                            "default".to_string(),
                        )]),
                        wait_for: vec![],
                    },
                    ChartSpec {
                        release: "istiod".to_string(),
                        chart: "istiod".to_string(),
                        values: ambient(&[]),
                        wait_for: vec![ResourceRef::new(
                            ResourceKind::Deployment,
                            "istiod",
                            Some(mesh_ns.as_str()),
                        )],
                    },
                    ChartSpec {
                        release: "istio-cni".to_string(),
                        chart: "cni".to_string(),
                        values: ambient(&[("global.platform", "kind")]),
                        wait_for: vec![ResourceRef::new(
                            ResourceKind::DaemonSet,
                            "istio-cni-node",
                            Some(mesh_ns.as_str()),
                        )],
                    },
                    ChartSpec {
                        release: "ztunnel".to_string(),
                        chart: "ztunnel".to_string(),
                        values: BTreeMap::new(),
                        wait_for: vec![ResourceRef::new(
                            ResourceKind::DaemonSet,
                            "ztunnel",
                            Some(mesh_ns.as_str()),
                        )],
                    },
                ],
                namespace_labels: BTreeMap::from([(
                    "istio.io/dataplane-mode".to_string(),
                    "ambient".to_string(),
                )]),
            },
            addons: ["prometheus", "kiali"]
                .iter()
                .map(|name| AddonSpec {
                    name: name.to_string(),
                    manifest: format!(
                        "https://raw.githubusercontent.com/istio/istio/release-1.26/samples/addons/{}.yaml",
                        name
                    ),
                    wait_for: vec![ResourceRef::new(
                        ResourceKind::Deployment,
                        name,
                        Some(mesh_ns.as_str()),
                    )],
                })
                .collect(),
            secrets: vec![
                SecretSpec {
                    name: "github-token-secret".to_string(),
                    key: "token".to_string(),
                    from: "TOKEN".to_string(),
                },
                SecretSpec {
                    name: "openai-secret".to_string(),
                    key: "apikey".to_string(),
                    from: "OPENAI_API_KEY".to_string(),
                },
            ],
            workloads,
            routes: vec![
                "manifests/gateway/gateway.yaml".to_string(),
                "manifests/gateway/http-routes.yaml".to_string(),
                "manifests/gateway/service-entries.yaml".to_string(),
            ],
            polling: PollingSpec::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

/// RFC 1123 label as used for namespaces and kind cluster names
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
