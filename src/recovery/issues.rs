use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Infrastructure,
    Code,
    Dependency,
    ExternalService,
    Stage,
    MultiAgent,
    Data,
    System,
}

/// Failure classifications understood by the recovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    // Infrastructure
    ProcessHang,
    ZombieProcess,
    MemoryExhaustion,
    DiskSpaceLow,
    CpuOverload,
    NetworkTimeout,

    // Code
    CompilationError,
    TestFailure,
    LintFailure,
    SyntaxError,
    TypeError,
    RuntimeException,

    // Dependency
    DependencyConflict,
    MissingDependency,
    VersionMismatch,

    // External services
    ApiRateLimit,
    ApiUnavailable,
    AuthenticationFailure,

    // Stage
    StageTimeout,
    StageCrash,
    InvalidStageOutput,
    StageCircuitOpen,

    // Multi-agent
    AgentDeadlock,
    AgentCommunicationFailure,
    AgentConflict,

    // Data
    DataCorruption,
    SchemaValidationFailure,
    MissingArtifact,

    // System
    ConfigurationError,
    PermissionDenied,
    StateInconsistency,
    CheckpointCorruption,
    UnknownFailure,
}

impl IssueType {
    pub const ALL: [IssueType; 33] = [
        IssueType::ProcessHang,
        IssueType::ZombieProcess,
        IssueType::MemoryExhaustion,
        IssueType::DiskSpaceLow,
        IssueType::CpuOverload,
        IssueType::NetworkTimeout,
        IssueType::CompilationError,
        IssueType::TestFailure,
        IssueType::LintFailure,
        IssueType::SyntaxError,
        IssueType::TypeError,
        IssueType::RuntimeException,
        IssueType::DependencyConflict,
        IssueType::MissingDependency,
        IssueType::VersionMismatch,
        IssueType::ApiRateLimit,
        IssueType::ApiUnavailable,
        IssueType::AuthenticationFailure,
        IssueType::StageTimeout,
        IssueType::StageCrash,
        IssueType::InvalidStageOutput,
        IssueType::StageCircuitOpen,
        IssueType::AgentDeadlock,
        IssueType::AgentCommunicationFailure,
        IssueType::AgentConflict,
        IssueType::DataCorruption,
        IssueType::SchemaValidationFailure,
        IssueType::MissingArtifact,
        IssueType::ConfigurationError,
        IssueType::PermissionDenied,
        IssueType::StateInconsistency,
        IssueType::CheckpointCorruption,
        IssueType::UnknownFailure,
    ];

    pub fn category(self) -> IssueCategory {
        use IssueType::*;

        match self {
            ProcessHang | ZombieProcess | MemoryExhaustion | DiskSpaceLow | CpuOverload
            | NetworkTimeout => IssueCategory::Infrastructure,
            CompilationError | TestFailure | LintFailure | SyntaxError | TypeError
            | RuntimeException => IssueCategory::Code,
            DependencyConflict | MissingDependency | VersionMismatch => IssueCategory::Dependency,
            ApiRateLimit | ApiUnavailable | AuthenticationFailure => IssueCategory::ExternalService,
            StageTimeout | StageCrash | InvalidStageOutput | StageCircuitOpen => IssueCategory::Stage,
            AgentDeadlock | AgentCommunicationFailure | AgentConflict => IssueCategory::MultiAgent,
            DataCorruption | SchemaValidationFailure | MissingArtifact => IssueCategory::Data,
            ConfigurationError | PermissionDenied | StateInconsistency | CheckpointCorruption
            | UnknownFailure => IssueCategory::System,
        }
    }

    /// Severity used when the registration does not carry one
    pub fn default_severity(self) -> Severity {
        use IssueType::*;

        match self {
            MemoryExhaustion | DataCorruption | CheckpointCorruption | AgentDeadlock
            | StateInconsistency => Severity::Critical,
            ProcessHang | ZombieProcess | DiskSpaceLow | CompilationError | TestFailure
            | SyntaxError | TypeError | RuntimeException | DependencyConflict
            | MissingDependency | AuthenticationFailure | StageCrash | StageCircuitOpen
            | PermissionDenied | ConfigurationError | MissingArtifact => Severity::High,
            CpuOverload | NetworkTimeout | VersionMismatch | ApiUnavailable | StageTimeout
            | InvalidStageOutput | AgentCommunicationFailure | AgentConflict
            | SchemaValidationFailure | UnknownFailure => Severity::Medium,
            LintFailure | ApiRateLimit => Severity::Low,
        }
    }

    pub fn in_category(category: IssueCategory) -> impl Iterator<Item = IssueType> {
        Self::ALL.into_iter().filter(move |issue| issue.category() == category)
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde name so logs and persisted documents agree
        match serde_json::to_value(self) {
            Ok(serde_json::Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// Data supplied by a health-signal producer when registering an issue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl IssueMetadata {
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIssue {
    pub issue_type: IssueType,
    pub category: IssueCategory,
    /// Highest severity seen across registrations
    pub severity: Severity,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Metadata of every registration, oldest first
    pub metadata: Vec<IssueMetadata>,
}

/// Deduplicated set of active issues keyed by type
#[derive(Debug, Clone, Default)]
pub struct IssueTracker {
    active: BTreeMap<IssueType, ActiveIssue>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an occurrence; returns the updated entry.
    pub fn register(&mut self, issue_type: IssueType, metadata: IssueMetadata) -> &ActiveIssue {
        let now = Utc::now();
        let severity = metadata.severity.unwrap_or_else(|| issue_type.default_severity());

        let entry = self.active.entry(issue_type).or_insert_with(|| ActiveIssue {
            issue_type,
            category: issue_type.category(),
            severity,
            occurrences: 0,
            first_seen: now,
            last_seen: now,
            metadata: Vec::new(),
        });

        entry.occurrences = entry.occurrences.saturating_add(1);
        entry.severity = entry.severity.max(severity);
        entry.last_seen = now;
        entry.metadata.push(metadata);

        info!(
            issue_type = %issue_type,
            category = ?entry.category,
            severity = ?entry.severity,
            occurrences = entry.occurrences,
            "Issue registered"
        );
        entry
    }

    /// Remove the issue and all of its occurrences.
    pub fn resolve(&mut self, issue_type: IssueType) -> Option<ActiveIssue> {
        let resolved = self.active.remove(&issue_type);
        match &resolved {
            Some(issue) => info!(
                issue_type = %issue_type,
                occurrences = issue.occurrences,
                "Issue resolved"
            ),
            None => debug!(issue_type = %issue_type, "Resolve requested for inactive issue"),
        }
        resolved
    }

    pub fn clear(&mut self) -> usize {
        let count = self.active.len();
        self.active.clear();
        count
    }

    pub fn is_active(&self, issue_type: IssueType) -> bool {
        self.active.contains_key(&issue_type)
    }

    pub fn get(&self, issue_type: IssueType) -> Option<&ActiveIssue> {
        self.active.get(&issue_type)
    }

    pub fn active_issues(&self) -> impl Iterator<Item = &ActiveIssue> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Occurrences counted across every active issue at or above `severity`
    pub fn occurrences_at_least(&self, severity: Severity) -> u32 {
        self.active
            .values()
            .filter(|issue| issue.severity >= severity)
            .map(|issue| issue.occurrences)
            .sum()
    }

    pub(crate) fn restore(&mut self, issues: Vec<ActiveIssue>) {
        self.active = issues
            .into_iter()
            .map(|issue| (issue.issue_type, issue))
            .collect();
    }
}
