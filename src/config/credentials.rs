/// Credential loading and validation
///
/// Credentials come from a local `KEY=VALUE` file, with the process
/// environment filling in keys the file does not set. They are validated
/// once, before anything touches the cluster, and are immutable afterwards.
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{error, info, warn};

use crate::error::ProvisionError;

/// Variables that must be set before any mutating step runs
pub const REQUIRED_VARS: [&str; 3] = ["TOKEN", "REPO_USER", "OPENAI_API_KEY"];

/// Variable substituted into workload templates
pub const REPO_USER: &str = "REPO_USER";

/// Raw variables gathered from the env file and process environment
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    values: BTreeMap<String, String>,
}

impl EnvSource {
    /// Build a source from explicit pairs
    #[cfg(test)]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Load the env file (if present), then fall back to the process
    /// environment for any of `keys` the file does not define
    pub fn load(path: &Path, keys: &[&str]) -> Result<Self> {
        let mut source = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read env file {}", path.display()))?;
            let values = parse_env_file(&content)
                .with_context(|| format!("Failed to parse env file {}", path.display()))?;
            info!("Loaded {} variables from {}", values.len(), path.display());
            Self { values }
        } else {
            warn!(
                "Env file {} not found, using the process environment",
                path.display()
            );
            Self::default()
        };

        for key in keys {
            if !source.values.contains_key(*key) {
                if let Ok(value) = std::env::var(key) {
                    source.values.insert(key.to_string(), value);
                }
            }
        }

        Ok(source)
    }

    /// Get a variable's value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Parse `KEY=VALUE` lines
///
/// Accepts an optional `export ` prefix, `#` comments, blank lines and
/// single- or double-quoted values.
pub fn parse_env_file(content: &str) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected KEY=VALUE", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            anyhow::bail!("line {}: invalid variable name '{}'", index + 1, key);
        }

        values.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(values)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            // Anything after the closing quote is a comment
            if let Some(end) = rest.find(quote) {
                return &rest[..end];
            }
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}

/// Presence check for a single variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableCheck {
    pub name: String,
    pub present: bool,
}

/// Result of checking every required variable
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checks: Vec<VariableCheck>,
}

impl ValidationReport {
    /// Names of every missing or empty variable, in check order
    pub fn missing(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.present)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.present)
    }
}

/// Check each required variable, logging one line per variable
///
/// Every variable is checked even after a failure so the operator sees the
/// complete list in one run.
pub fn validate(source: &EnvSource, required: &[&str]) -> ValidationReport {
    let checks = required
        .iter()
        .map(|name| {
            let present = source.get(name).is_some_and(|v| !v.trim().is_empty());
            if present {
                info!("✓ {} is set", name);
            } else {
                error!("✗ {} is not set", name);
            }
            VariableCheck {
                name: name.to_string(),
                present,
            }
        })
        .collect();

    ValidationReport { checks }
}

/// Validated, immutable credential set
#[derive(Clone)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    /// Validate the source and keep only the required variables
    pub fn from_source(source: &EnvSource, required: &[&str]) -> Result<Self> {
        let report = validate(source, required);
        if !report.is_ok() {
            return Err(ProvisionError::MissingCredentials(report.missing()).into());
        }

        let values = required
            .iter()
            .filter_map(|name| source.get(name).map(|v| (name.to_string(), v.to_string())))
            .collect();

        Ok(Self { values })
    }

    /// Look up a credential by variable name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Identity substituted into workload templates
    pub fn repo_user(&self) -> &str {
        self.get(REPO_USER).unwrap_or_default()
    }

    /// Variables available to template substitution
    pub fn template_vars(&self) -> BTreeMap<&str, &str> {
        BTreeMap::from([(REPO_USER, self.repo_user())])
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn full_source() -> EnvSource {
        EnvSource::from_pairs([
            ("TOKEN", "ghp_example"),
            ("REPO_USER", "octocat"),
            ("OPENAI_API_KEY", "sk-example"),
        ])
    }

    #[test]
    fn test_parse_env_file() {
        let content = r#"
# credentials for the demo
export TOKEN="ghp_quoted"
REPO_USER=octocat # inline comment
OPENAI_API_KEY='sk-single'
EMPTY=
QUOTED_NOTE="abc" # rotated monthly
SINGLE_NOTE='a # b' # hash inside quotes
"#;
        let values = parse_env_file(content).unwrap();

        assert_eq!(values["TOKEN"], "ghp_quoted");
        assert_eq!(values["REPO_USER"], "octocat");
        assert_eq!(values["OPENAI_API_KEY"], "sk-single");
        assert_eq!(values["EMPTY"], "");
        assert_eq!(values["QUOTED_NOTE"], "abc");
        assert_eq!(values["SINGLE_NOTE"], "a # b");
    }

    #[test]
    fn test_parse_env_file_rejects_garbage() {
        let err = parse_env_file("TOKEN=ok\nnot a pair\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_prefers_file_over_process_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "AGENTBED_TEST_FILE_VAR=from-file").unwrap();

        std::env::set_var("AGENTBED_TEST_FILE_VAR", "from-env");
        std::env::set_var("AGENTBED_TEST_ENV_ONLY", "env-only");

        let source = EnvSource::load(
            file.path(),
            &["AGENTBED_TEST_FILE_VAR", "AGENTBED_TEST_ENV_ONLY"],
        )
        .unwrap();

        assert_eq!(source.get("AGENTBED_TEST_FILE_VAR"), Some("from-file"));
        assert_eq!(source.get("AGENTBED_TEST_ENV_ONLY"), Some("env-only"));
    }

    #[test]
    fn test_load_missing_file_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = EnvSource::load(&dir.path().join(".env"), &[]).unwrap();
        assert_eq!(source.get("TOKEN"), None);
    }

    #[test]
    fn test_validate_reports_every_missing_variable() {
        // Every non-empty subset of unset variables is reported in full
        for mask in 1u8..8 {
            let pairs: Vec<(&str, &str)> = REQUIRED_VARS
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) == 0)
                .map(|(_, name)| (*name, "value"))
                .collect();
            let expected: Vec<String> = REQUIRED_VARS
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| name.to_string())
                .collect();

            let report = validate(&EnvSource::from_pairs(pairs), &REQUIRED_VARS);

            assert!(!report.is_ok());
            assert_eq!(report.missing(), expected);
            assert_eq!(report.checks.len(), 3);
        }
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let source = EnvSource::from_pairs([
            ("TOKEN", "ghp_example"),
            ("REPO_USER", "octocat"),
            ("OPENAI_API_KEY", ""),
        ]);

        let report = validate(&source, &REQUIRED_VARS);

        assert_eq!(
            report.checks,
            vec![
                VariableCheck {
                    name: "TOKEN".to_string(),
                    present: true
                },
                VariableCheck {
                    name: "REPO_USER".to_string(),
                    present: true
                },
                VariableCheck {
                    name: "OPENAI_API_KEY".to_string(),
                    present: false
                },
            ]
        );

        let err = Credentials::from_source(&source, &REQUIRED_VARS).unwrap_err();
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::MissingCredentials(names)) => {
                assert_eq!(names, &vec!["OPENAI_API_KEY".to_string()])
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let credentials = Credentials::from_source(&full_source(), &REQUIRED_VARS).unwrap();

        assert_eq!(credentials.repo_user(), "octocat");
        assert_eq!(credentials.get("TOKEN"), Some("ghp_example"));
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("ghp_example"));
    }
}
