use std::time::Instant;

use loom_types::{EnforcementConfig, EnforcementMode, OnViolation, Protocol, Severity, Violation};
use serde::Serialize;
use uuid::Uuid;

use crate::evaluator::{evaluate, EvalContext};
use crate::pattern::any_match;

/// What the caller should do after a failed validation, derived from the
/// owning protocol's `onViolation`/`allowOverride` settings and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SuggestedAction {
    Abort,
    Retry,
    Override,
    Continue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementFinding {
    pub protocol_id: String,
    pub constraint_id: String,
    pub severity: Severity,
    pub message: String,
    pub suggested_action: SuggestedAction,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub allowed: bool,
    pub findings: Vec<EnforcementFinding>,
}

/// Protocols that apply to `ctx`, by matching `applicable_contexts` against
/// the relevant dimensions. An unscoped protocol applies everywhere.
pub fn applicable_protocols<'a>(protocols: &'a [Protocol], ctx: &EvalContext) -> Vec<&'a Protocol> {
    protocols
        .iter()
        .filter(|p| p.enabled && !p.deprecated)
        .filter(|p| {
            let ac = &p.applicable_contexts;
            if ac.is_unscoped() {
                return true;
            }
            dimension_matches(&ac.feature_id_patterns, ctx.feature_id.as_deref())
                && dimension_matches(&ac.file_patterns, ctx.file_path.as_deref())
                && dimension_matches(&ac.project_patterns, ctx.project_path.as_deref())
                && dimension_matches(&ac.task_patterns, ctx.task.as_deref())
                && dimension_matches(&ac.environment_patterns, ctx.environment.as_deref())
        })
        .collect()
}

fn dimension_matches(patterns: &[String], value: Option<&str>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    match value {
        Some(v) => any_match(patterns, v),
        None => false,
    }
}

/// Runs pre-execution-eligible constraints (everything except the
/// post-execution-only kinds) across applicable protocols, in descending
/// priority order, and decides whether the operation may proceed.
pub fn validate_pre_execution(protocols: &[Protocol], ctx: &EvalContext) -> ValidationOutcome {
    validate(protocols, ctx, false)
}

/// Runs post-execution-eligible constraints (output_format, resource,
/// side_effect) against a completed worker's output.
pub fn validate_post_execution(protocols: &[Protocol], ctx: &EvalContext) -> ValidationOutcome {
    validate(protocols, ctx, true)
}

fn validate(protocols: &[Protocol], ctx: &EvalContext, post_execution: bool) -> ValidationOutcome {
    let mut applicable = applicable_protocols(protocols, ctx);
    applicable.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut findings = Vec::new();
    let mut allowed = true;

    for protocol in applicable {
        if post_execution && !protocol.enforcement.post_execution_validation {
            continue;
        }
        if !post_execution && !protocol.enforcement.pre_execution_validation {
            continue;
        }
        for constraint in &protocol.constraints {
            if !constraint.enabled {
                continue;
            }
            if constraint.rule.applies_post_execution() != post_execution {
                continue;
            }
            let outcome = evaluate(&constraint.rule, ctx);
            if outcome.passed {
                continue;
            }
            let suggested_action = suggested_action_for(&protocol.enforcement);
            if protocol.enforcement.mode == EnforcementMode::Strict
                && constraint.severity == Severity::Error
                && protocol.enforcement.on_violation == OnViolation::Block
            {
                allowed = false;
            }
            findings.push(EnforcementFinding {
                protocol_id: protocol.id.clone(),
                constraint_id: constraint.id.clone(),
                severity: constraint.severity,
                message: outcome.reason.unwrap_or_else(|| constraint.message.clone()),
                suggested_action,
            });
        }
    }

    ValidationOutcome { allowed, findings }
}

/// `allowOverride` takes priority (the operator may proceed anyway);
/// `rollback` suggests retrying after undoing side effects; `block` aborts;
/// everything else (warn/log/notify) just continues.
fn suggested_action_for(enforcement: &EnforcementConfig) -> SuggestedAction {
    if enforcement.allow_override {
        return SuggestedAction::Override;
    }
    match enforcement.on_violation {
        OnViolation::Block => SuggestedAction::Abort,
        OnViolation::Rollback => SuggestedAction::Retry,
        OnViolation::Warn | OnViolation::Log | OnViolation::Notify => SuggestedAction::Continue,
    }
}

/// The `protocol_validate_feature` operation surface (§6): the full
/// pre-execution report a caller needs to decide whether to dispatch a
/// worker, including the materialised `Violation` records (§4.5's "every
/// violation, regardless of `allowed`, is recorded").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureValidationReport {
    pub allowed: bool,
    pub applied_protocols: Vec<String>,
    pub violations: Vec<Violation>,
    pub warnings: Vec<String>,
    pub evaluation_time_ms: u64,
    pub suggested_action: Option<SuggestedAction>,
}

/// Runs `validate_pre_execution` and materialises its findings into
/// `Violation` records plus a human warning list, timing the evaluation.
/// Does not itself persist anything — the caller (the Session Controller)
/// threads the result through `Registry::record_violation` so the record
/// ends up in the same `load -> mutate -> save` cycle as everything else.
pub fn validate_feature(protocols: &[Protocol], ctx: &EvalContext) -> FeatureValidationReport {
    let started = Instant::now();
    let applied_protocols: Vec<String> = applicable_protocols(protocols, ctx).into_iter().map(|p| p.id.clone()).collect();
    let outcome = validate_pre_execution(protocols, ctx);

    let mut violations = Vec::new();
    let mut warnings = Vec::new();
    let mut suggested_action = None;
    for finding in &outcome.findings {
        if finding.severity == Severity::Warning || finding.severity == Severity::Info {
            warnings.push(format!("{}: {}", finding.protocol_id, finding.message));
        }
        violations.push(Violation {
            id: Uuid::new_v4().to_string(),
            protocol_id: finding.protocol_id.clone(),
            constraint_id: finding.constraint_id.clone(),
            feature_id: ctx.feature_id.clone(),
            worker_id: None,
            timestamp: ctx.now,
            severity: finding.severity,
            message: finding.message.clone(),
            context: serde_json::json!({"tool": ctx.tool, "filePath": ctx.file_path}),
            resolved: false,
            resolved_at: None,
            resolution: None,
        });
        suggested_action.get_or_insert(finding.suggested_action);
    }

    FeatureValidationReport {
        allowed: outcome.allowed,
        applied_protocols,
        violations,
        warnings,
        evaluation_time_ms: started.elapsed().as_millis() as u64,
        suggested_action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{Constraint, ConstraintRule, EnforcementConfig, ToolRestrictionRule};

    fn protocol_with(mode: EnforcementMode, on_violation: OnViolation, priority: u32) -> Protocol {
        Protocol {
            id: "p".to_string(),
            version: "1.0.0".to_string(),
            name: "p".to_string(),
            description: None,
            extends: Vec::new(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            constraints: vec![Constraint {
                id: "deny-bash".to_string(),
                severity: Severity::Error,
                message: "bash is not allowed".to_string(),
                enabled: true,
                conditions: None,
                rule: ConstraintRule::ToolRestriction(ToolRestrictionRule {
                    denied_tools: vec!["bash".to_string()],
                    ..Default::default()
                }),
            }],
            enforcement: EnforcementConfig {
                mode,
                on_violation,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority,
            tags: None,
            enabled: true,
            deprecated: false,
            created_at: chrono::Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn strict_block_disallows_operation() {
        let protocols = vec![protocol_with(EnforcementMode::Strict, OnViolation::Block, 10)];
        let mut ctx = EvalContext {
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let outcome = validate_pre_execution(&protocols, &ctx);
        assert!(!outcome.allowed);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn permissive_warn_allows_operation_but_reports_finding() {
        let protocols = vec![protocol_with(EnforcementMode::Permissive, OnViolation::Warn, 10)];
        let mut ctx = EvalContext {
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let outcome = validate_pre_execution(&protocols, &ctx);
        assert!(outcome.allowed);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn deprecated_protocol_is_never_applicable() {
        let mut protocol = protocol_with(EnforcementMode::Strict, OnViolation::Block, 10);
        protocol.deprecated = true;
        let protocols = vec![protocol];
        let mut ctx = EvalContext {
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let outcome = validate_pre_execution(&protocols, &ctx);
        assert!(outcome.allowed);
        assert!(outcome.findings.is_empty());
    }

    #[test]
    fn higher_priority_protocol_is_evaluated_first() {
        let low = protocol_with(EnforcementMode::Strict, OnViolation::Block, 1);
        let mut high = protocol_with(EnforcementMode::Strict, OnViolation::Block, 99);
        high.id = "high".to_string();
        let protocols = vec![low, high];
        let mut ctx = EvalContext {
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let outcome = validate_pre_execution(&protocols, &ctx);
        assert_eq!(outcome.findings[0].protocol_id, "high");
    }

    #[test]
    fn allow_override_takes_priority_over_on_violation() {
        let mut protocol = protocol_with(EnforcementMode::Strict, OnViolation::Block, 10);
        protocol.enforcement.allow_override = true;
        let protocols = vec![protocol];
        let mut ctx = EvalContext {
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let outcome = validate_pre_execution(&protocols, &ctx);
        assert_eq!(outcome.findings[0].suggested_action, SuggestedAction::Override);
    }

    #[test]
    fn validate_feature_materialises_a_violation_record_per_finding() {
        let protocols = vec![protocol_with(EnforcementMode::Strict, OnViolation::Block, 10)];
        let mut ctx = EvalContext {
            feature_id: Some("f-1".to_string()),
            now: chrono::Utc::now(),
            ..Default::default()
        };
        ctx.tool = Some("bash".to_string());
        let report = validate_feature(&protocols, &ctx);
        assert!(!report.allowed);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].feature_id.as_deref(), Some("f-1"));
        assert_eq!(report.suggested_action, Some(SuggestedAction::Abort));
    }
}
