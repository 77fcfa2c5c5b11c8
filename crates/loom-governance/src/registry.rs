use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Result};
use chrono::Utc;
use loom_core::atomic::write_json_atomic;
use loom_core::paths::OrchestratorPaths;
use loom_types::{AuditAction, AuditEntry, Protocol, Severity, Violation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

const MAX_VIOLATIONS: usize = 1000;
const MAX_AUDIT_LOG: usize = 5000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDocument {
    protocols: Vec<Protocol>,
    violations: Vec<Violation>,
    audit_log: Vec<AuditEntry>,
    last_updated: Option<chrono::DateTime<Utc>>,
}

/// Owns Protocols, Violations and AuditEntries. A corrupt registry file is
/// treated as an empty registry, logged once, never thrown.
pub struct Registry {
    paths: OrchestratorPaths,
    protocols: RwLock<HashMap<String, Protocol>>,
    violations: RwLock<Vec<Violation>>,
    audit_log: RwLock<Vec<AuditEntry>>,
}

impl Registry {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            paths: OrchestratorPaths::new(project_dir),
            protocols: RwLock::new(HashMap::new()),
            violations: RwLock::new(Vec::new()),
            audit_log: RwLock::new(Vec::new()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let raw = match fs::read_to_string(self.paths.protocol_registry_file()).await {
            Ok(raw) => raw,
            Err(_) => return Ok(()),
        };
        let doc: RegistryDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "protocol registry file is corrupt, treating as empty registry");
                return Ok(());
            }
        };
        let mut protocols = self.protocols.write().await;
        for protocol in doc.protocols {
            protocols.insert(protocol.id.clone(), protocol);
        }
        *self.violations.write().await = doc.violations;
        *self.audit_log.write().await = doc.audit_log;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let protocols: Vec<Protocol> = self.protocols.read().await.values().cloned().collect();
        let violations = self.violations.read().await.clone();
        let audit_log = self.audit_log.read().await.clone();
        let doc = RegistryDocument {
            protocols,
            violations,
            audit_log,
            last_updated: Some(Utc::now()),
        };
        write_json_atomic(&self.paths.protocol_registry_file(), &doc).await
    }

    pub async fn get(&self, id: &str) -> Option<Protocol> {
        self.protocols.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Protocol> {
        self.protocols.read().await.values().cloned().collect()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.protocols
            .read()
            .await
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Checks I3-I4 against already-registered protocols, inserts or
    /// updates, then audits.
    pub async fn register(&self, protocol: Protocol) -> Result<()> {
        if Protocol::parse_semver(&protocol.version).is_none() {
            bail!("invalid semver: {}", protocol.version);
        }
        {
            let protocols = self.protocols.read().await;
            for active in protocols.values().filter(|p| p.enabled) {
                if active.conflicts.contains(&protocol.id) || protocol.conflicts.contains(&active.id) {
                    bail!(
                        "protocol {} conflicts with already-active protocol {}",
                        protocol.id,
                        active.id
                    );
                }
            }
        }
        let id = protocol.id.clone();
        self.protocols.write().await.insert(id.clone(), protocol);
        self.audit(AuditAction::Register, Some(id), json!({}), None).await;
        self.save().await
    }

    /// Checks conflicts with the currently-active set and demands required
    /// ancestors active (I3, I4).
    pub async fn activate(&self, id: &str) -> Result<()> {
        let (requires, conflicts) = {
            let protocols = self.protocols.read().await;
            let protocol = protocols
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("unknown protocol: {id}"))?;
            (protocol.requires.clone(), protocol.conflicts.clone())
        };
        {
            let protocols = self.protocols.read().await;
            for active in protocols.values().filter(|p| p.enabled) {
                if conflicts.contains(&active.id) || active.conflicts.contains(&id.to_string()) {
                    bail!("protocol {id} conflicts with active protocol {}", active.id);
                }
            }
            for required in &requires {
                let is_active = protocols.get(required).map(|p| p.enabled).unwrap_or(false);
                if !is_active {
                    bail!("required protocol {required} is not active");
                }
            }
        }
        let mut protocols = self.protocols.write().await;
        if let Some(protocol) = protocols.get_mut(id) {
            protocol.enabled = true;
            protocol.updated_at = Some(Utc::now());
        }
        drop(protocols);
        self.audit(AuditAction::Activate, Some(id.to_string()), json!({}), None).await;
        self.save().await
    }

    /// Denied if any active protocol requires `id` (I4).
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        {
            let protocols = self.protocols.read().await;
            for other in protocols.values().filter(|p| p.enabled && p.id != id) {
                if other.requires.contains(&id.to_string()) {
                    bail!("protocol {} requires {id}; cannot deactivate", other.id);
                }
            }
        }
        let mut protocols = self.protocols.write().await;
        if let Some(protocol) = protocols.get_mut(id) {
            protocol.enabled = false;
            protocol.updated_at = Some(Utc::now());
        }
        drop(protocols);
        self.audit(AuditAction::Deactivate, Some(id.to_string()), json!({}), None).await;
        self.save().await
    }

    /// Denied if any other protocol extends or requires `id` (I5).
    pub async fn delete(&self, id: &str) -> Result<()> {
        {
            let protocols = self.protocols.read().await;
            for other in protocols.values().filter(|p| p.id != id) {
                if other.extends.contains(&id.to_string()) || other.requires.contains(&id.to_string()) {
                    bail!("protocol {} extends or requires {id}; cannot delete", other.id);
                }
            }
        }
        self.protocols.write().await.remove(id);
        self.audit(AuditAction::Delete, Some(id.to_string()), json!({}), None).await;
        self.save().await
    }

    pub async fn update(&self, protocol: Protocol) -> Result<()> {
        let id = protocol.id.clone();
        self.protocols.write().await.insert(id.clone(), protocol);
        self.audit(AuditAction::Update, Some(id), json!({}), None).await;
        self.save().await
    }

    pub async fn record_violation(&self, violation: Violation) {
        let mut violations = self.violations.write().await;
        violations.push(violation.clone());
        loom_core::storage::truncate_bounded(&mut violations, MAX_VIOLATIONS);
        drop(violations);
        self.audit(
            AuditAction::Violation,
            Some(violation.protocol_id.clone()),
            json!({"violationId": violation.id, "severity": violation.severity}),
            None,
        )
        .await;
        if let Err(err) = self.save().await {
            warn!(error = %err, "failed to persist registry after recording a violation");
        }
    }

    pub async fn resolve_violation(&self, violation_id: &str, resolution: Option<String>) -> Result<()> {
        let protocol_id = {
            let mut violations = self.violations.write().await;
            let violation = violations
                .iter_mut()
                .find(|v| v.id == violation_id)
                .ok_or_else(|| anyhow::anyhow!("unknown violation: {violation_id}"))?;
            violation.resolved = true;
            violation.resolved_at = Some(Utc::now());
            violation.resolution = resolution;
            violation.protocol_id.clone()
        };
        self.audit(
            AuditAction::ResolveViolation,
            Some(protocol_id),
            json!({"violationId": violation_id}),
            None,
        )
        .await;
        self.save().await
    }

    pub async fn violations(&self) -> Vec<Violation> {
        self.violations.read().await.clone()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log.read().await.clone()
    }

    pub async fn snapshot_map(&self) -> HashMap<String, Protocol> {
        self.protocols.read().await.clone()
    }

    async fn audit(&self, action: AuditAction, protocol_id: Option<String>, details: Value, actor: Option<String>) {
        let mut log = self.audit_log.write().await;
        log.push(AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            protocol_id,
            details,
            actor,
        });
        loom_core::storage::truncate_bounded(&mut log, MAX_AUDIT_LOG);
    }

    pub fn next_violation_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn default_violation(protocol_id: &str, constraint_id: &str, severity: Severity, message: impl Into<String>, context: Value) -> Violation {
        Violation {
            id: Self::next_violation_id(),
            protocol_id: protocol_id.to_string(),
            constraint_id: constraint_id.to_string(),
            feature_id: None,
            worker_id: None,
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            context,
            resolved: false,
            resolved_at: None,
            resolution: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{EnforcementConfig, EnforcementMode, OnViolation};

    fn protocol(id: &str) -> Protocol {
        Protocol {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            name: id.to_string(),
            description: None,
            extends: Vec::new(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            constraints: Vec::new(),
            enforcement: EnforcementConfig {
                mode: EnforcementMode::Strict,
                on_violation: OnViolation::Block,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority: 100,
            tags: None,
            enabled: false,
            deprecated: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn register_rejects_invalid_semver() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut p = protocol("p1");
        p.version = "not-semver".to_string();
        assert!(registry.register(p).await.is_err());
    }

    #[tokio::test]
    async fn activate_rejects_conflicting_active_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut a = protocol("a");
        a.conflicts = vec!["b".to_string()];
        let b = protocol("b");
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();
        registry.activate("a").await.unwrap();
        assert!(registry.activate("b").await.is_err());
    }

    #[tokio::test]
    async fn activate_requires_ancestor_active() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut dependent = protocol("dependent");
        dependent.requires = vec!["base".to_string()];
        registry.register(protocol("base")).await.unwrap();
        registry.register(dependent).await.unwrap();
        assert!(registry.activate("dependent").await.is_err());
        registry.activate("base").await.unwrap();
        registry.activate("dependent").await.unwrap();
    }

    #[tokio::test]
    async fn delete_denied_while_another_protocol_requires_it() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut dependent = protocol("dependent");
        dependent.requires = vec!["base".to_string()];
        registry.register(protocol("base")).await.unwrap();
        registry.register(dependent).await.unwrap();
        assert!(registry.delete("base").await.is_err());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.register(protocol("p1")).await.unwrap();
        registry.save().await.unwrap();

        let reloaded = Registry::new(dir.path());
        reloaded.load().await.unwrap();
        assert!(reloaded.get("p1").await.is_some());
    }

    #[tokio::test]
    async fn violations_are_truncated_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        for i in 0..1005 {
            registry
                .record_violation(Registry::default_violation(
                    "p1",
                    "c1",
                    Severity::Error,
                    format!("violation {i}"),
                    json!({}),
                ))
                .await;
        }
        assert_eq!(registry.violations().await.len(), MAX_VIOLATIONS);
    }
}
