// Sandbox configuration
// Loaded once at startup from config/sandbox.json, then overridden from the environment

use crate::types::ResourceLimits;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/sandbox.json";

/// Build descriptor and limits for one source language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: String,
    pub dockerfile_path: PathBuf,
    pub source_file: String,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

impl LanguageProfile {
    /// Apply this profile's overrides on top of the global limits
    pub fn limits(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_limit_mb: self.memory_limit_mb.unwrap_or(defaults.memory_limit_mb),
            cpu_limit: self.cpu_limit.unwrap_or(defaults.cpu_limit),
            pids_limit: defaults.pids_limit,
        }
    }

    pub fn load_descriptor(&self) -> Result<Vec<u8>> {
        fs::read(&self.dockerfile_path).with_context(|| {
            format!(
                "Failed to read build descriptor for '{}': {}",
                self.name,
                self.dockerfile_path.display()
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime endpoint; local defaults when unset
    pub docker_host: Option<String>,
    /// Parent directory for per-request staging areas; system temp dir when unset
    pub staging_root: Option<PathBuf>,
    pub build_timeout_ms: u64,
    /// Bound on each of the container create and start calls
    pub launch_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    pub reap_timeout_ms: u64,
    pub max_source_bytes: usize,
    pub max_context_bytes: usize,
    pub max_output_bytes: usize,
    pub max_concurrency: usize,
    pub limits: ResourceLimits,
    pub languages: Vec<LanguageProfile>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            staging_root: None,
            build_timeout_ms: 300_000,
            launch_timeout_ms: 30_000,
            execution_timeout_ms: 10_000,
            reap_timeout_ms: 15_000,
            max_source_bytes: 1024 * 1024,
            max_context_bytes: 8 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_concurrency: 4,
            limits: ResourceLimits::default(),
            languages: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Sandbox config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: SandboxConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load config/sandbox.json, falling back to built-in defaults when it is absent
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Override settings from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DOCKER_HOST").filter(|h| !h.trim().is_empty()) {
            self.docker_host = Some(host);
        }
        if let Some(ms) = lookup("RUNBOX_EXECUTION_TIMEOUT_MS") {
            self.execution_timeout_ms = ms
                .parse()
                .with_context(|| format!("Invalid RUNBOX_EXECUTION_TIMEOUT_MS: {}", ms))?;
        }
        if let Some(ms) = lookup("RUNBOX_BUILD_TIMEOUT_MS") {
            self.build_timeout_ms = ms
                .parse()
                .with_context(|| format!("Invalid RUNBOX_BUILD_TIMEOUT_MS: {}", ms))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.execution_timeout_ms == 0
            || self.build_timeout_ms == 0
            || self.launch_timeout_ms == 0
            || self.reap_timeout_ms == 0
        {
            bail!("Timeouts must be greater than zero");
        }
        self.limits
            .validate()
            .map_err(|e| anyhow!("Invalid default limits: {}", e))?;
        for profile in &self.languages {
            profile
                .limits(&self.limits)
                .validate()
                .map_err(|e| anyhow!("Invalid limits for language '{}': {}", profile.name, e))?;
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.max_source_bytes > self.max_context_bytes {
            bail!(
                "max_source_bytes ({}) exceeds max_context_bytes ({})",
                self.max_source_bytes,
                self.max_context_bytes
            );
        }
        Ok(())
    }

    /// Get the profile for a language
    pub fn get_profile(&self, name: &str) -> Result<&LanguageProfile> {
        self.languages
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("No configuration found for language: {}", name))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        self.languages.iter().map(|p| p.name.clone()).collect()
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }
}
