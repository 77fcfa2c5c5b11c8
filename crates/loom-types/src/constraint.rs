use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolRestrictionRule {
    pub denied_tools: Vec<String>,
    /// Deny-patterns; glob or `/regex/`, may be prefixed `!` for negation.
    pub tool_patterns: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub require_approval: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileAccessRule {
    pub denied_paths: Vec<String>,
    pub denied_extensions: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub read_only: Vec<String>,
    pub write_only: Vec<String>,
    pub max_file_size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputFormatRule {
    pub max_length: Option<usize>,
    pub format: Option<String>,
    pub required_fields: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    pub required_patterns: Vec<String>,
    pub json_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehavioralRule {
    pub required_actions: Vec<String>,
    pub forbidden_actions: Vec<String>,
    pub max_concurrency: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemporalRule {
    pub rate_limit_per_minute: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
    pub cooldown_seconds: Option<u64>,
    pub valid_from: Option<chrono::DateTime<chrono::Utc>>,
    pub valid_until: Option<chrono::DateTime<chrono::Utc>>,
    /// UTC hours, 0-23.
    pub allowed_hours: Option<Vec<u8>>,
    /// ISO weekday numbers, 1 (Monday) - 7 (Sunday).
    pub allowed_days: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRule {
    pub max_concurrent_workers: Option<u32>,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SideEffectRule {
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub denied_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintRule {
    ToolRestriction(ToolRestrictionRule),
    FileAccess(FileAccessRule),
    OutputFormat(OutputFormatRule),
    Behavioral(BehavioralRule),
    Temporal(TemporalRule),
    Resource(ResourceRule),
    SideEffect(SideEffectRule),
}

impl ConstraintRule {
    pub fn kind(&self) -> &'static str {
        match self {
            ConstraintRule::ToolRestriction(_) => "tool_restriction",
            ConstraintRule::FileAccess(_) => "file_access",
            ConstraintRule::OutputFormat(_) => "output_format",
            ConstraintRule::Behavioral(_) => "behavioral",
            ConstraintRule::Temporal(_) => "temporal",
            ConstraintRule::Resource(_) => "resource",
            ConstraintRule::SideEffect(_) => "side_effect",
        }
    }

    /// Whether this constraint kind is meaningful to evaluate post-hoc,
    /// against a completed worker's output rather than a pending action.
    pub fn applies_post_execution(&self) -> bool {
        matches!(
            self,
            ConstraintRule::OutputFormat(_) | ConstraintRule::Resource(_) | ConstraintRule::SideEffect(_)
        )
    }
}

/// A single typed rule with severity; evaluated against a context; emits
/// pass/fail with reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    #[serde(flatten)]
    pub rule: ConstraintRule,
}

fn default_true() -> bool {
    true
}
