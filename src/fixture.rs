/// In-memory cluster for unit tests.
///
/// `FakeCluster` implements `CommandRunner` and answers docker, kind, kubectl
/// and helm invocations from local state. Every invocation is recorded so
/// tests can assert on exactly what was run.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::config::Playbook;
use crate::utils::command::{CommandOutput, CommandRunner, Invocation};

const WORKLOAD_KINDS: [&str; 3] = ["deployment", "daemonset", "statefulset"];

#[derive(Debug, Clone)]
struct Workload {
    /// Existence checks that still come back empty
    hidden_for: u32,
}

#[derive(Default)]
struct FakeState {
    invocations: Vec<Invocation>,
    clusters: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<String, BTreeMap<String, String>>,
    workloads: HashMap<(String, String, String), Workload>,
    helm_repos: HashSet<String>,
    pulled: Vec<String>,
    loaded: Vec<(String, String)>,
    failing_rollouts: HashSet<String>,
    failures: Vec<(String, Vec<String>, i32)>,
    apply_hidden_for: u32,
}

/// Mock cluster and tooling for unit tests
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let state = FakeState {
            apply_hidden_for: 1,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Register a deployment that shows up after `hidden_for` empty checks
    pub fn add_pending_deployment(&self, namespace: &str, name: &str, hidden_for: u32) {
        self.add_workload(namespace, "deployment", name, hidden_for);
    }

    /// Register any rollout-capable workload
    pub fn add_workload(&self, namespace: &str, kind: &str, name: &str, hidden_for: u32) {
        let mut state = self.state.lock().unwrap();
        state.workloads.insert(
            (namespace.to_string(), kind.to_string(), name.to_string()),
            Workload { hidden_for },
        );
    }

    /// Register every mesh and add-on resource the playbook waits for
    pub fn with_platform(self, playbook: &Playbook) -> Self {
        let resources = playbook
            .mesh
            .charts
            .iter()
            .flat_map(|c| c.wait_for.iter())
            .chain(playbook.addons.iter().flat_map(|a| a.wait_for.iter()));
        for resource in resources {
            self.add_workload(
                resource.namespace_or(&playbook.mesh.namespace),
                resource.kind.as_str(),
                &resource.name,
                0,
            );
        }
        self
    }

    /// Make `kubectl rollout status` fail for this resource name
    pub fn fail_rollout(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_rollouts
            .insert(name.to_string());
    }

    /// Make any invocation of `program` starting with `words` fail
    pub fn fail_when(&self, program: &str, words: &[&str], code: i32) {
        self.state.lock().unwrap().failures.push((
            program.to_string(),
            words.iter().map(|w| w.to_string()).collect(),
            code,
        ));
    }

    pub fn add_kind_cluster(&self, name: &str) {
        self.state.lock().unwrap().clusters.insert(name.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Invocations whose arguments start with `words`, for any program
    pub fn count(&self, words: &[&str]) -> usize {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|i| i.starts_with(words))
            .count()
    }

    /// Secrets as `namespace/name`
    pub fn secrets(&self) -> Vec<String> {
        self.state.lock().unwrap().secrets.keys().cloned().collect()
    }

    /// Decoded value of one secret key
    pub fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let encoded = state
            .secrets
            .get(&format!("{}/{}", namespace, name))?
            .get(key)?;
        STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Deployments in a namespace, sorted by name
    pub fn deployments(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .workloads
            .keys()
            .filter(|(ns, kind, _)| ns == namespace && kind == "deployment")
            .map(|(_, _, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn clusters(&self) -> Vec<String> {
        self.state.lock().unwrap().clusters.iter().cloned().collect()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    /// Images loaded into kind, as `(image, cluster)`
    pub fn loaded_images(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().loaded.clone()
    }
}

#[async_trait]
impl CommandRunner for FakeCluster {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.invocations.push(invocation.clone());

        let program = invocation.program.as_str();
        let injected = state.failures.iter().find(|(p, words, _)| {
            p == program && invocation.starts_with(&words.iter().map(String::as_str).collect::<Vec<_>>())
        });
        if let Some((_, _, code)) = injected {
            return Ok(CommandOutput::failed(program, *code, "injected failure"));
        }

        let output = match program {
            "kubectl" => state.kubectl(invocation),
            "kind" => state.kind(invocation),
            "docker" => state.docker(invocation),
            "helm" => state.helm(invocation),
            _ => CommandOutput::failed(program, 127, format!("{}: command not found", program)),
        };
        Ok(output)
    }
}

#[derive(Deserialize)]
struct ManifestDoc {
    kind: Option<String>,
    #[serde(default)]
    metadata: ManifestMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct ManifestMeta {
    #[serde(default)]
    name: String,
    namespace: Option<String>,
}

impl FakeState {
    fn kubectl(&mut self, inv: &Invocation) -> CommandOutput {
        let args = &inv.args;
        let namespace = inv.flag_value("-n").unwrap_or("default").to_string();

        if inv.starts_with(&["version"]) || inv.starts_with(&["label"]) {
            return CommandOutput::ok("kubectl", "");
        }

        if inv.starts_with(&["get", "deployments"]) {
            return CommandOutput::ok("kubectl", self.deployment_list(&namespace));
        }

        if inv.starts_with(&["get"]) && args.len() >= 3 {
            let (kind, name) = (args[1].as_str(), args[2].as_str());
            let found = match kind {
                "secret" => self.secrets.contains_key(&format!("{}/{}", namespace, name)),
                "namespace" => self.namespaces.contains(name),
                _ => match self.workloads.get_mut(&(
                    namespace.clone(),
                    kind.to_string(),
                    name.to_string(),
                )) {
                    Some(w) if w.hidden_for > 0 => {
                        w.hidden_for -= 1;
                        false
                    }
                    Some(_) => true,
                    None => false,
                },
            };
            let stdout = if found {
                format!("{}/{}\n", kind, name)
            } else {
                String::new()
            };
            return CommandOutput::ok("kubectl", stdout);
        }

        if inv.starts_with(&["create", "namespace"]) && args.len() >= 3 {
            if !self.namespaces.insert(args[2].clone()) {
                return CommandOutput::failed("kubectl", 1, "AlreadyExists");
            }
            return CommandOutput::ok("kubectl", format!("namespace/{} created\n", args[2]));
        }

        if inv.starts_with(&["create", "-f", "-"]) {
            let doc: ManifestDoc =
                match serde_json::from_str(inv.stdin.as_deref().unwrap_or_default()) {
                    Ok(doc) => doc,
                    Err(e) => return CommandOutput::failed("kubectl", 1, e.to_string()),
                };
            let ns = doc.metadata.namespace.clone().unwrap_or(namespace);
            let key = format!("{}/{}", ns, doc.metadata.name);
            if self.secrets.contains_key(&key) {
                return CommandOutput::failed("kubectl", 1, "AlreadyExists");
            }
            self.secrets.insert(key, doc.data);
            return CommandOutput::ok("kubectl", format!("secret/{} created\n", doc.metadata.name));
        }

        if inv.starts_with(&["apply", "-f"]) && args.len() >= 3 {
            let content = if args[2] == "-" {
                inv.stdin.clone()
            } else {
                std::fs::read_to_string(&args[2]).ok()
            };
            let mut applied = Vec::new();
            if let Some(content) = content {
                for document in serde_yaml::Deserializer::from_str(&content) {
                    let Ok(doc) = ManifestDoc::deserialize(document) else {
                        continue;
                    };
                    let Some(kind) = doc.kind.map(|k| k.to_lowercase()) else {
                        continue;
                    };
                    if WORKLOAD_KINDS.contains(&kind.as_str()) {
                        let ns = doc.metadata.namespace.unwrap_or_else(|| namespace.clone());
                        self.workloads
                            .entry((ns, kind.clone(), doc.metadata.name.clone()))
                            .or_insert(Workload {
                                hidden_for: self.apply_hidden_for,
                            });
                    }
                    applied.push(format!("{}/{} configured", kind, doc.metadata.name));
                }
            } else {
                applied.push(format!("{} configured", args[2]));
            }
            return CommandOutput::ok("kubectl", applied.join("\n"));
        }

        if inv.starts_with(&["rollout", "status"]) && args.len() >= 3 {
            let Some((kind, name)) = args[2].split_once('/') else {
                return CommandOutput::failed("kubectl", 1, "invalid target");
            };
            if self.failing_rollouts.contains(name) {
                return CommandOutput::failed(
                    "kubectl",
                    1,
                    "error: timed out waiting for the condition",
                );
            }
            let key = (namespace, kind.to_string(), name.to_string());
            return match self.workloads.get(&key) {
                Some(_) => CommandOutput::ok("kubectl", "successfully rolled out\n"),
                None => CommandOutput::failed("kubectl", 1, "NotFound"),
            };
        }

        CommandOutput::failed("kubectl", 1, format!("unsupported: {}", inv.command_line()))
    }

    fn deployment_list(&self, namespace: &str) -> String {
        let items: Vec<serde_json::Value> = self
            .workloads
            .iter()
            .filter(|((ns, kind, _), _)| ns == namespace && kind == "deployment")
            .map(|((_, _, name), w)| {
                let ready = if w.hidden_for == 0 { 1 } else { 0 };
                serde_json::json!({
                    "metadata": {"name": name},
                    "spec": {"replicas": 1},
                    "status": {"readyReplicas": ready, "availableReplicas": ready},
                })
            })
            .collect();
        serde_json::json!({ "items": items }).to_string()
    }

    fn kind(&mut self, inv: &Invocation) -> CommandOutput {
        let name = inv.flag_value("--name").unwrap_or("kind").to_string();

        if inv.starts_with(&["version"]) {
            CommandOutput::ok("kind", "kind v0.27.0\n")
        } else if inv.starts_with(&["get", "clusters"]) {
            let list: Vec<&str> = self.clusters.iter().map(String::as_str).collect();
            CommandOutput::ok("kind", list.join("\n"))
        } else if inv.starts_with(&["create", "cluster"]) {
            if !self.clusters.insert(name.clone()) {
                return CommandOutput::failed(
                    "kind",
                    1,
                    format!("node(s) already exist for a cluster with the name \"{}\"", name),
                );
            }
            CommandOutput::ok("kind", "")
        } else if inv.starts_with(&["delete", "cluster"]) {
            self.clusters.remove(&name);
            CommandOutput::ok("kind", "")
        } else if inv.starts_with(&["load", "docker-image"]) && inv.args.len() >= 3 {
            if !self.clusters.contains(&name) {
                return CommandOutput::failed(
                    "kind",
                    1,
                    format!("no nodes found for cluster \"{}\"", name),
                );
            }
            self.loaded.push((inv.args[2].clone(), name));
            CommandOutput::ok("kind", "")
        } else {
            CommandOutput::failed("kind", 1, format!("unsupported: {}", inv.command_line()))
        }
    }

    fn docker(&mut self, inv: &Invocation) -> CommandOutput {
        if inv.starts_with(&["pull"]) && inv.args.len() >= 2 {
            self.pulled.push(inv.args[1].clone());
        }
        CommandOutput::ok("docker", "")
    }

    fn helm(&mut self, inv: &Invocation) -> CommandOutput {
        if inv.starts_with(&["repo", "add"]) && inv.args.len() >= 3 {
            let repo = inv.args[2].clone();
            if !self.helm_repos.insert(repo.clone()) {
                return CommandOutput::failed(
                    "helm",
                    1,
                    format!("Error: repository name ({}) already exists", repo),
                );
            }
        }
        CommandOutput::ok("helm", "")
    }
}
