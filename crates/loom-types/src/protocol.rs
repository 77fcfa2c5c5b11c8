use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Constraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Strict,
    Permissive,
    Audit,
    Learning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnViolation {
    Block,
    Warn,
    Log,
    Notify,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementConfig {
    pub mode: EnforcementMode,
    pub on_violation: OnViolation,
    #[serde(default = "default_true")]
    pub pre_execution_validation: bool,
    #[serde(default = "default_true")]
    pub post_execution_validation: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub allow_override: bool,
    #[serde(default)]
    pub override_requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_approvers: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Permissive,
            on_violation: OnViolation::Warn,
            pre_execution_validation: true,
            post_execution_validation: true,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            log_level: default_log_level(),
            allow_override: false,
            override_requires_approval: true,
            override_approvers: None,
        }
    }
}

/// The set of patterns (feature id, files, project, task, environment) that
/// gate whether a protocol applies to a given operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicableContexts {
    pub feature_id_patterns: Vec<String>,
    pub file_patterns: Vec<String>,
    pub project_patterns: Vec<String>,
    pub task_patterns: Vec<String>,
    pub environment_patterns: Vec<String>,
}

impl ApplicableContexts {
    /// Empty pattern lists on every dimension match everything, same as an
    /// unscoped protocol applying globally.
    pub fn is_unscoped(&self) -> bool {
        self.feature_id_patterns.is_empty()
            && self.file_patterns.is_empty()
            && self.project_patterns.is_empty()
            && self.task_patterns.is_empty()
            && self.environment_patterns.is_empty()
    }
}

/// A versioned, priority-ordered bundle of typed constraint rules governing
/// worker behaviour in matching contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub id: String,
    pub version: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub applicable_contexts: ApplicableContexts,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub enabled: bool,
    #[serde(default)]
    pub deprecated: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Protocol {
    /// Parses `major.minor.patch` into a comparable tuple; non-numeric or
    /// short components are treated as invalid, per the spec's explicit
    /// "invalid semver" input error.
    pub fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((major, minor, patch))
    }
}
