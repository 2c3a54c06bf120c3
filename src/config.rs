use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recovery::{HealthPolicy, Severity};
use crate::state_machine::{CircuitBreakerPolicy, PipelineState};

/// Main configuration structure for the conductor control plane
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Where and whether run state is written
    pub persistence: PersistenceConfig,
    /// Per-stage circuit breaker policy
    pub circuit_breaker: CircuitBreakerConfig,
    /// Aggregate health thresholds
    pub health: HealthConfig,
    /// Workflow execution and synthesis settings
    pub recovery: RecoveryConfig,
    /// Rollback stack settings
    pub rollback: RollbackConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Disable to run without durable state (writes become no-ops)
    pub enabled: bool,
    /// Directory holding one `<run_id>.state.json` per run
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open a stage's circuit
    pub failure_threshold: u32,
    /// Rolling window length in seconds
    pub window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub critical_issue_threshold: u32,
    pub critical_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Per-action timeout; unset means actions may run indefinitely
    pub action_timeout_secs: Option<u64>,
    /// Timeout for one synthesis request
    pub synthesis_timeout_secs: Option<u64>,
    /// Ask the synthesizer when no registered workflow helps
    pub enable_synthesis: bool,
    /// Failure state used when no workflow exists at all
    pub unrecoverable_state: PipelineState,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Pushes past this depth are refused; unset means unbounded
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_output: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: PathBuf::from(".conductor/state"),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window_seconds: 300, // 5 minutes
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        let policy = HealthPolicy::default();
        Self {
            critical_issue_threshold: policy.critical_issue_threshold,
            critical_severity: policy.critical_severity,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: Some(300),
            synthesis_timeout_secs: Some(60),
            enable_synthesis: true,
            unrecoverable_state: PipelineState::Critical,
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_depth: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_output: true,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            rollback: RollbackConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn policy(&self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_threshold: self.failure_threshold,
            window: chrono::Duration::seconds(self.window_seconds as i64),
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            critical_issue_threshold: self.critical_issue_threshold,
            critical_severity: self.critical_severity,
        }
    }
}

impl RecoveryConfig {
    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_secs.map(Duration::from_secs)
    }

    pub fn synthesis_timeout(&self) -> Option<Duration> {
        self.synthesis_timeout_secs.map(Duration::from_secs)
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (conductor.toml, .conductor-rc)
    /// 3. Environment variables (CONDUCTOR_SECTION__FIELD)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("conductor.toml").exists() {
            builder = builder.add_source(File::with_name("conductor"));
        }

        if Path::new(".conductor-rc").exists() {
            builder = builder.add_source(File::with_name(".conductor-rc").format(config::FileFormat::Toml));
        }

        builder = builder.add_source(Self::environment());

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    fn environment() -> Environment {
        // Double underscore separates sections so field names keep theirs
        Environment::with_prefix("CONDUCTOR")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
