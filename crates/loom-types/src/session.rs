use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::{Feature, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Paused,
    Reviewing,
    Completed,
    CompletedWithFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewConfig {
    pub code_review: bool,
    pub arch_review: bool,
    #[serde(default)]
    pub require_all_features_terminal: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            code_review: true,
            arch_review: false,
            require_all_features_terminal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceConfig {
    pub min_confidence: f64,
    pub alert_on_drop: bool,
}

/// The single in-flight or terminal record of one orchestration run in a
/// project directory. Exactly one exists per project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub project_dir: PathBuf,
    pub task_description: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub features: Vec<Feature>,
    pub workers: Vec<Worker>,
    pub progress_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_config: Option<ReviewConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_workers: Option<Vec<Worker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_review: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_config: Option<ConfidenceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_alerts: Option<Vec<String>>,
}

impl Session {
    pub fn new(project_dir: PathBuf, task_description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_dir,
            task_description: task_description.into(),
            status: SessionStatus::InProgress,
            start_time: now,
            last_updated: now,
            completed_at: None,
            features: Vec::new(),
            workers: Vec::new(),
            progress_log: Vec::new(),
            review_config: None,
            review_workers: None,
            aggregated_review: None,
            confidence_config: None,
            confidence_alerts: None,
        }
    }

    /// Appends a sanitised, timestamped line to the progress log.
    pub fn log(&mut self, line: impl AsRef<str>) {
        let sanitised = sanitise_log_line(line.as_ref());
        self.progress_log
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), sanitised));
        self.last_updated = Utc::now();
    }
}

/// Strips control characters and newlines before a line is ever written to
/// the progress log; part of the data contract, not presentation.
pub fn sanitise_log_line(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_strips_newlines_and_control_chars() {
        let raw = "line one\nline two\tstep\x07bell";
        let clean = sanitise_log_line(raw);
        assert!(!clean.contains('\n'));
        assert!(!clean.contains('\x07'));
    }

    #[test]
    fn new_session_starts_in_progress() {
        let session = Session::new(PathBuf::from("/tmp/proj"), "build a thing");
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.features.is_empty());
    }
}
