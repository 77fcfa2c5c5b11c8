//! Shared data model for the orchestration engine.
//!
//! Every entity here is serde-round-trippable to the JSON shapes persisted
//! by `loom-core`'s state store. Field names use `camelCase` on the wire to
//! match the external operation surface.

mod audit;
mod constraint;
mod feature;
mod proposal;
mod protocol;
mod session;
mod sync;
mod worker;

pub use audit::{AuditAction, AuditEntry};
pub use constraint::{
    BehavioralRule, Constraint, ConstraintRule, FileAccessRule, OutputFormatRule, ResourceRule,
    Severity, SideEffectRule, TemporalRule, ToolRestrictionRule,
};
pub use feature::{CompetingPlans, Feature, FeatureStatus, PlanningPhase};
pub use proposal::{Issue, IssueType, Proposal, ProposalSource, ProposalStatus, RiskLevel, ValidationResult};
pub use protocol::{ApplicableContexts, EnforcementConfig, EnforcementMode, OnViolation, Protocol};
pub use session::{ConfidenceConfig, ReviewConfig, Session, SessionStatus};
pub use sync::{SyncEnvelope, SyncMessage, VectorOrdering, VersionVector};
pub use worker::{Worker, WorkerRole, WorkerStatus};

/// A recorded failure of one constraint against a context.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: String,
    pub protocol_id: String,
    pub constraint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// Generates a fresh, lowercase 32-hex-char identifier, used for instance
/// ids and other identifiers that must not look like a UUID's dashed form.
pub fn hex_id_32() -> String {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", &a[..16], &b[..16])
}

pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
