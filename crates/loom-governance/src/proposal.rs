use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use loom_core::atomic::write_json_atomic;
use loom_core::paths::OrchestratorPaths;
use loom_types::{
    ConstraintRule, Issue, IssueType, Proposal, ProposalSource, ProposalStatus, Protocol, RiskLevel,
    ValidationResult,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::pattern::any_match;
use crate::registry::Registry;

/// Fixed, non-negotiable floor every proposed protocol is checked against,
/// independent of anything the proposal itself declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseConstraints {
    pub prohibited_tools: Vec<String>,
    pub prohibited_paths: Vec<String>,
    pub prohibited_operations: Vec<String>,
    pub minimum_severity: loom_types::Severity,
    pub acceptance_threshold: f64,
}

impl Default for BaseConstraints {
    fn default() -> Self {
        Self {
            prohibited_tools: vec!["rm".to_string(), "sudo".to_string()],
            prohibited_paths: vec!["/etc/*".to_string(), "~/.ssh/*".to_string()],
            prohibited_operations: vec!["delete_session".to_string()],
            minimum_severity: loom_types::Severity::Warning,
            acceptance_threshold: 70.0,
        }
    }
}

pub struct ProposalManager {
    paths: OrchestratorPaths,
    base_constraints: BaseConstraints,
    proposals: RwLock<HashMap<String, Proposal>>,
}

impl ProposalManager {
    pub fn new(project_dir: &Path, base_constraints: BaseConstraints) -> Self {
        Self {
            paths: OrchestratorPaths::new(project_dir),
            base_constraints,
            proposals: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let mut entries = match fs::read_dir(self.paths.proposals_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let mut proposals = self.proposals.write().await;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<Proposal>(&raw) {
                    Ok(proposal) => {
                        proposals.insert(proposal.id.clone(), proposal);
                    }
                    Err(err) => warn!(error = %err, path = %path.display(), "skipping corrupt proposal file"),
                },
                Err(err) => warn!(error = %err, path = %path.display(), "failed to read proposal file"),
            }
        }
        Ok(())
    }

    async fn persist(&self, proposal: &Proposal) -> Result<()> {
        write_json_atomic(&self.paths.proposal_file(&proposal.id), proposal).await
    }

    /// Builds a Proposal from a draft protocol, runs base-constraint
    /// validation and risk scoring, and persists it.
    pub async fn submit(
        &self,
        protocol: Protocol,
        source: ProposalSource,
        description: Option<String>,
        rationale: Option<String>,
        submitted_by: Option<String>,
    ) -> Result<Proposal> {
        let validation = self.validate(&protocol);
        let now = Utc::now();
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            protocol,
            source,
            description,
            rationale,
            priority: 50,
            submitted_at: now,
            submitted_by,
            expires_at: Some(now + Duration::days(7)),
            status: ProposalStatus::Pending,
            validation,
            reviewed_at: None,
            reviewed_by: None,
            review_reason: None,
            modifications: None,
        };
        self.persist(&proposal).await?;
        self.proposals.write().await.insert(proposal.id.clone(), proposal.clone());
        Ok(proposal)
    }

    /// Base-constraint check plus a labelled risk score. Schema validation
    /// (malformed rules) is enforced structurally by `Protocol`'s typed
    /// fields at deserialization time, so only semantic checks remain here.
    fn validate(&self, protocol: &Protocol) -> ValidationResult {
        let mut issues = Vec::new();

        for constraint in &protocol.constraints {
            if let ConstraintRule::ToolRestriction(rule) = &constraint.rule {
                for tool in &self.base_constraints.prohibited_tools {
                    let explicitly_allowed = rule.allowed_tools.iter().any(|t| t == tool);
                    let missing_deny = !rule.denied_tools.iter().any(|t| t == tool)
                        && !any_match(&rule.tool_patterns, tool);
                    if explicitly_allowed {
                        issues.push(Issue {
                            issue_type: IssueType::Error,
                            message: format!("prohibited tool `{tool}` is explicitly allowed"),
                            location: Some(format!("constraints[{}].allowedTools", constraint.id)),
                            suggested_fix: None,
                        });
                    } else if missing_deny {
                        issues.push(Issue {
                            issue_type: IssueType::Error,
                            message: format!("prohibited tool `{tool}` is not explicitly denied"),
                            location: Some(format!("constraints[{}].deniedTools", constraint.id)),
                            suggested_fix: Some(format!("add `{tool}` to deniedTools")),
                        });
                    }
                }
            }
            if let ConstraintRule::FileAccess(rule) = &constraint.rule {
                for path in &self.base_constraints.prohibited_paths {
                    let explicitly_allowed = any_match(&rule.allowed_paths, path);
                    let missing_deny = !any_match(&rule.denied_paths, path);
                    if explicitly_allowed {
                        issues.push(Issue {
                            issue_type: IssueType::Error,
                            message: format!("prohibited path `{path}` is explicitly allowed"),
                            location: Some(format!("constraints[{}].allowedPaths", constraint.id)),
                            suggested_fix: None,
                        });
                    } else if missing_deny {
                        issues.push(Issue {
                            issue_type: IssueType::Error,
                            message: format!("prohibited path `{path}` is not explicitly denied"),
                            location: Some(format!("constraints[{}].deniedPaths", constraint.id)),
                            suggested_fix: Some(format!("add `{path}` to deniedPaths")),
                        });
                    }
                }
            }
        }

        let has_unfixable_error = issues
            .iter()
            .any(|i| i.issue_type == IssueType::Error && i.suggested_fix.is_none());
        let is_fixable = !issues.is_empty() && !has_unfixable_error;
        let is_valid = issues.iter().all(|i| i.issue_type != IssueType::Error);

        let overall_score = self.risk_score(protocol, &issues);
        let risk_level = risk_level_for(overall_score);

        ValidationResult {
            is_valid,
            is_fixable,
            risk_level,
            overall_score,
            issues,
        }
    }

    fn risk_score(&self, protocol: &Protocol, issues: &[Issue]) -> f64 {
        let mut score = 0.0_f64;
        score += (issues.iter().filter(|i| i.issue_type == IssueType::Error).count() as f64) * 25.0;
        for constraint in &protocol.constraints {
            match &constraint.rule {
                ConstraintRule::ToolRestriction(rule) if rule.allowed_tools.is_empty() && rule.tool_patterns.is_empty() => {
                    score += 5.0;
                }
                ConstraintRule::SideEffect(_) => score += 15.0,
                _ => {}
            }
        }
        if protocol.enforcement.mode != loom_types::EnforcementMode::Strict {
            score += 10.0;
        }
        if protocol.enforcement.allow_override {
            score += 15.0;
        }
        score += (protocol.priority as f64) / 20.0;
        score.min(100.0)
    }

    pub fn is_acceptable(&self, validation: &ValidationResult) -> bool {
        validation.overall_score <= self.base_constraints.acceptance_threshold
    }

    /// Sweeps expired proposals (status transitions to `expired`) and
    /// returns the current set.
    pub async fn list(&self) -> Vec<Proposal> {
        let now = Utc::now();
        let mut proposals = self.proposals.write().await;
        for proposal in proposals.values_mut() {
            if proposal.status == ProposalStatus::Pending || proposal.status == ProposalStatus::Reviewing {
                if let Some(expires_at) = proposal.expires_at {
                    if now > expires_at {
                        proposal.status = ProposalStatus::Expired;
                    }
                }
            }
        }
        proposals.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Proposal> {
        self.proposals.read().await.get(id).cloned()
    }

    pub fn base_constraints(&self) -> &BaseConstraints {
        &self.base_constraints
    }

    /// Moves a pending proposal into `reviewing`, the holding state before
    /// an `approve`/`reject` decision is recorded.
    pub async fn review(&self, id: &str) -> Result<Proposal> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown proposal: {id}"))?;
        if proposal.status != ProposalStatus::Pending {
            bail!("proposal {id} is not pending; cannot move to reviewing");
        }
        proposal.status = ProposalStatus::Reviewing;
        let updated = proposal.clone();
        drop(proposals);
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Approves the proposal and registers its protocol. Rejects approval
    /// of anything that failed base-constraint validation.
    pub async fn approve(&self, id: &str, registry: &Registry, reviewed_by: Option<String>) -> Result<Proposal> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown proposal: {id}"))?;
        if !proposal.validation.is_valid {
            bail!("proposal {id} failed base-constraint validation and cannot be approved");
        }
        proposal.status = ProposalStatus::Approved;
        proposal.reviewed_at = Some(Utc::now());
        proposal.reviewed_by = reviewed_by;
        let updated = proposal.clone();
        drop(proposals);
        self.persist(&updated).await?;
        registry.register(updated.protocol.clone()).await?;
        Ok(updated)
    }

    pub async fn reject(&self, id: &str, reason: String, reviewed_by: Option<String>) -> Result<Proposal> {
        let mut proposals = self.proposals.write().await;
        let proposal = proposals
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown proposal: {id}"))?;
        proposal.status = ProposalStatus::Rejected;
        proposal.reviewed_at = Some(Utc::now());
        proposal.reviewed_by = reviewed_by;
        proposal.review_reason = Some(reason);
        let updated = proposal.clone();
        drop(proposals);
        self.persist(&updated).await?;
        Ok(updated)
    }
}

fn risk_level_for(score: f64) -> RiskLevel {
    if score >= 90.0 {
        RiskLevel::Critical
    } else if score >= 70.0 {
        RiskLevel::High
    } else if score >= 40.0 {
        RiskLevel::Medium
    } else if score >= 15.0 {
        RiskLevel::Low
    } else {
        RiskLevel::Minimal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{Constraint, EnforcementConfig, EnforcementMode, OnViolation, Severity, ToolRestrictionRule};

    fn draft_protocol(allowed_tools: Vec<&str>, denied_tools: Vec<&str>) -> Protocol {
        Protocol {
            id: "draft".to_string(),
            version: "1.0.0".to_string(),
            name: "draft".to_string(),
            description: None,
            extends: Vec::new(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            constraints: vec![Constraint {
                id: "c1".to_string(),
                severity: Severity::Error,
                message: "tool restriction".to_string(),
                enabled: true,
                conditions: None,
                rule: ConstraintRule::ToolRestriction(ToolRestrictionRule {
                    allowed_tools: allowed_tools.into_iter().map(String::from).collect(),
                    denied_tools: denied_tools.into_iter().map(String::from).collect(),
                    ..Default::default()
                }),
            }],
            enforcement: EnforcementConfig {
                mode: EnforcementMode::Strict,
                on_violation: OnViolation::Block,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority: 50,
            tags: None,
            enabled: false,
            deprecated: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn explicit_allow_of_prohibited_tool_is_unfixable_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProposalManager::new(dir.path(), BaseConstraints::default());
        let proposal = manager
            .submit(draft_protocol(vec!["rm"], vec![]), ProposalSource::Llm, None, None, None)
            .await
            .unwrap();
        assert!(!proposal.validation.is_valid);
        assert!(!proposal.validation.is_fixable);
        assert_eq!(proposal.validation.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn missing_deny_of_prohibited_tool_is_fixable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProposalManager::new(dir.path(), BaseConstraints::default());
        let proposal = manager
            .submit(draft_protocol(vec![], vec![]), ProposalSource::Llm, None, None, None)
            .await
            .unwrap();
        assert!(!proposal.validation.is_valid);
        assert!(proposal.validation.is_fixable);
    }

    #[tokio::test]
    async fn approve_fails_for_invalid_proposal_but_reject_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProposalManager::new(dir.path(), BaseConstraints::default());
        let registry = Registry::new(dir.path());
        let proposal = manager
            .submit(draft_protocol(vec!["rm"], vec![]), ProposalSource::Llm, None, None, None)
            .await
            .unwrap();
        assert!(manager.approve(&proposal.id, &registry, None).await.is_err());
        let rejected = manager
            .reject(&proposal.id, "base constraint violation".to_string(), None)
            .await
            .unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);
    }

    #[tokio::test]
    async fn review_transitions_pending_to_reviewing_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProposalManager::new(dir.path(), BaseConstraints::default());
        let proposal = manager
            .submit(draft_protocol(vec![], vec!["rm", "sudo"]), ProposalSource::User, None, None, None)
            .await
            .unwrap();
        let reviewing = manager.review(&proposal.id).await.unwrap();
        assert_eq!(reviewing.status, ProposalStatus::Reviewing);
        assert!(manager.review(&proposal.id).await.is_err());
    }

    #[tokio::test]
    async fn valid_proposal_can_be_approved_and_registers_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProposalManager::new(dir.path(), BaseConstraints::default());
        let registry = Registry::new(dir.path());
        let proposal = manager
            .submit(draft_protocol(vec![], vec!["rm", "sudo"]), ProposalSource::User, None, None, None)
            .await
            .unwrap();
        assert!(proposal.validation.is_valid);
        let approved = manager.approve(&proposal.id, &registry, None).await.unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert!(registry.get("draft").await.is_some());
    }
}
