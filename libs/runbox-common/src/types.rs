use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix shared by every runtime object this service creates
pub const RESOURCE_PREFIX: &str = "runbox";

/// Longest accepted execution id
pub const MAX_ID_LEN: usize = 64;

pub const DEFAULT_SOURCE_NAME: &str = "main.go";

/// Resource ceiling applied to a single execution container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_memory_limit_mb() -> u32 {
    256
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_pids_limit() -> i64 {
    128
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_limit_mb) * 1024 * 1024
    }

    /// CPU ceiling in the runtime's billionths-of-a-CPU unit
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    /// Every ceiling must be positive; the runtime reads zero as unlimited
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_limit_mb == 0 {
            return Err("memory_limit_mb must be greater than zero".to_string());
        }
        if !(self.cpu_limit.is_finite() && self.cpu_limit > 0.0) {
            return Err(format!("cpu_limit must be positive, got {}", self.cpu_limit));
        }
        if self.pids_limit <= 0 {
            return Err(format!("pids_limit must be positive, got {}", self.pids_limit));
        }
        Ok(())
    }
}

/// One unit of work: source text plus the descriptor used to build it.
///
/// The id names every runtime object created on behalf of the request, so it
/// must be unique among requests that run at the same time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    pub source_text: String,
    #[serde(default = "default_source_name")]
    pub source_name: String,
    pub build_descriptor: Vec<u8>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_source_name() -> String {
    DEFAULT_SOURCE_NAME.to_string()
}

impl ExecutionRequest {
    /// Create a request with a freshly generated id
    pub fn new(source_text: impl Into<String>, build_descriptor: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), source_text, build_descriptor)
    }

    pub fn with_id(
        id: impl Into<String>,
        source_text: impl Into<String>,
        build_descriptor: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            source_text: source_text.into(),
            source_name: default_source_name(),
            build_descriptor: build_descriptor.into(),
            allow_network: false,
            limits: None,
        }
    }

    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    pub fn allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Check that the id can safely name images, containers and staging dirs.
    ///
    /// Only lowercase ASCII is accepted: image references are lowercase, and
    /// folding case would let two distinct ids share one image tag. Runs of
    /// `[a-z0-9]` may be joined only by `.`, `_`, `__` or dashes, and the id
    /// must end in `[a-z0-9]`, matching an image repository component.
    pub fn validate_id(&self) -> Result<(), String> {
        let id = self.id.as_str();
        if id.is_empty() {
            return Err("execution id must not be empty".to_string());
        }
        if id.len() > MAX_ID_LEN {
            return Err(format!(
                "execution id exceeds {} characters",
                MAX_ID_LEN
            ));
        }
        if !id.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(format!("execution id '{}' must start with [a-z0-9]", id));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!(
                "execution id '{}' contains invalid character {:?}",
                id, bad
            ));
        }

        let mut separator = String::new();
        for c in id.chars() {
            if c.is_ascii_alphanumeric() {
                if !separator.is_empty() && !is_repository_separator(&separator) {
                    return Err(format!(
                        "execution id '{}' contains invalid separator '{}'",
                        id, separator
                    ));
                }
                separator.clear();
            } else {
                separator.push(c);
            }
        }
        if !separator.is_empty() {
            return Err(format!("execution id '{}' must end with [a-z0-9]", id));
        }
        Ok(())
    }

    pub fn image_tag(&self) -> String {
        format!("{}-{}:latest", RESOURCE_PREFIX, self.id)
    }

    pub fn container_name(&self) -> String {
        format!("{}-{}", RESOURCE_PREFIX, self.id)
    }

    pub fn staging_prefix(&self) -> String {
        format!("{}-{}-", RESOURCE_PREFIX, self.id)
    }
}

fn is_repository_separator(run: &str) -> bool {
    matches!(run, "." | "_" | "__") || run.chars().all(|c| c == '-')
}

/// Lifecycle of one execution.
///
/// `Reaping` is reachable from every non-terminal phase; `Done` only from
/// `Reaping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Assembling,
    Building,
    Launching,
    Running,
    Collecting,
    Reaping,
    Done,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Done, _) => false,
            (Reaping, Done) => true,
            (Reaping, _) => false,
            (_, Reaping) => true,
            (Pending, Assembling)
            | (Assembling, Building)
            | (Building, Launching)
            | (Launching, Running)
            | (Running, Collecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::Assembling => "assembling",
            Phase::Building => "building",
            Phase::Launching => "launching",
            Phase::Running => "running",
            Phase::Collecting => "collecting",
            Phase::Reaping => "reaping",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Class of failure that ended the forward phases early.
///
/// Timeouts during the run are not listed: they surface through
/// `ExecutionResult::timed_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Assembly,
    Build,
    BuildTimeout,
    Launch,
    Cancelled,
}

/// Outcome of one execution, returned exactly once per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub output: String,
    pub build_succeeded: bool,
    pub run_succeeded: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub exit_code: Option<i64>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub build_log: String,
    /// Non-fatal problems met while collecting output or cleaning up
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.build_succeeded && self.run_succeeded && !self.timed_out && self.failure.is_none()
    }
}
