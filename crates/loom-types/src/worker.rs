use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Implementor,
    PlannerA,
    PlannerB,
    Voter(u8),
    CodeReviewer,
    ArchReviewer,
}

impl WorkerRole {
    pub fn label(&self) -> String {
        match self {
            WorkerRole::Implementor => "implementor".to_string(),
            WorkerRole::PlannerA => "plannerA".to_string(),
            WorkerRole::PlannerB => "plannerB".to_string(),
            WorkerRole::Voter(n) => format!("voter-{n}"),
            WorkerRole::CodeReviewer => "codeReviewer".to_string(),
            WorkerRole::ArchReviewer => "archReviewer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Crashed,
    Unknown,
}

/// An external code-agent subprocess running in a named terminal session,
/// observed by the core through file side-effects and session capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub session_name: String,
    pub feature_id: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
