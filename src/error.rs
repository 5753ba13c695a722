/// Typed failures surfaced by provisioning steps
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("missing required credentials: {}", .0.join(", "))]
    MissingCredentials(Vec<String>),

    #[error("{program} failed ({}): {}", describe_code(.code), .stderr.trim())]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{resource} did not appear after {attempts} checks")]
    PollExhausted { resource: String, attempts: u32 },

    #[error("timed out after {seconds} seconds waiting for {resource}")]
    PollTimeout { resource: String, seconds: u64 },

    #[error("template {template} has unresolved placeholders: {}", .names.join(", "))]
    Template { template: String, names: Vec<String> },

    #[error("invalid playbook: {0}")]
    InvalidPlaybook(String),
}

impl ProvisionError {
    /// Process exit code for this failure.
    ///
    /// Failed commands pass their own status through so the caller sees what
    /// the tool reported. Everything else exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::CommandFailed {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Exit code for an error chain, looking for the first typed failure
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map(ProvisionError::exit_code)
        .unwrap_or(1)
}
