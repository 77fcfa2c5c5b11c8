use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::WorkerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningPhase {
    Planning,
    Evaluating,
    Implementing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetingPlans {
    pub plan_a: Option<Value>,
    pub plan_b: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_reason: Option<String>,
}

/// A unit of work in a session, with identity, status, dependencies, and at
/// most one associated Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub description: String,
    pub status: FeatureStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set by the completion monitor when a worker reaches a terminal state;
    /// the feature itself stays `in_progress` until the caller inspects the
    /// result and calls `feature_mark_complete` (spec.md §4.3: "a worker
    /// becoming completed/crashed does not auto-advance the feature").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_outcome: Option<WorkerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_phase: Option<PlanningPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competing_plans: Option<CompetingPlans>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_winner: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_bindings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_verification: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<Value>,
}

impl Feature {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: FeatureStatus::Pending,
            attempts: 0,
            depends_on: Vec::new(),
            worker_id: None,
            started_at: None,
            completed_at: None,
            last_error: None,
            worker_outcome: None,
            complexity: None,
            planning_phase: None,
            competing_plans: None,
            voting_group: None,
            voting_role: None,
            voting_score: None,
            voting_winner: None,
            context: None,
            protocol_bindings: None,
            routing: None,
            git_verification: None,
            validation: None,
            validation_result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FeatureStatus::Completed | FeatureStatus::Failed)
    }
}
