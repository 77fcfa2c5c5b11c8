use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use loom_core::atomic::write_json_atomic;
use loom_core::paths::OrchestratorPaths;
use loom_types::Protocol;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::registry::Registry;
use crate::resolver::order_for_registration;
use crate::sync::{resolve_conflict, ConflictWinner, InstanceRecord};

/// A self-contained collection of protocols plus the order they must be
/// registered in, for cross-instance distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub bundle_id: String,
    pub created_at: DateTime<Utc>,
    pub protocols: Vec<Protocol>,
    pub registration_order: Vec<String>,
}

/// A known peer instance, as persisted to `distribution/peers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub instance_id: String,
    pub project_dir: String,
    pub last_seen: DateTime<Utc>,
}

impl From<InstanceRecord> for Peer {
    fn from(record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            project_dir: record.project_dir,
            last_seen: record.last_heartbeat,
        }
    }
}

/// Builds a Bundle from the registry's current protocols, restricted to
/// `ids` when given, and persists it under `distribution/exports/`.
pub async fn export_bundle(registry: &Registry, paths: &OrchestratorPaths, ids: Option<&[String]>) -> Result<Bundle> {
    let all = registry.list().await;
    let selected: Vec<Protocol> = match ids {
        Some(ids) => all.into_iter().filter(|p| ids.contains(&p.id)).collect(),
        None => all,
    };
    let registration_order = order_for_registration(&selected);
    let bundle = Bundle {
        bundle_id: Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        protocols: selected,
        registration_order,
    };
    write_json_atomic(&paths.distribution_export(&bundle.bundle_id), &bundle).await?;
    Ok(bundle)
}

pub async fn read_bundle(paths: &OrchestratorPaths, bundle_id: &str) -> Result<Bundle> {
    let raw = fs::read_to_string(paths.distribution_export(bundle_id)).await?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub registered: Vec<String>,
    pub overwritten: Vec<String>,
    pub kept_local: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Registers every protocol in `bundle` in `registration_order`, so
/// dependencies land before dependents. When a protocol id already exists
/// locally, the conflict is resolved the same way the sync transport
/// resolves a concurrent update (§4.7): higher version wins, then later
/// timestamp, then the local copy is kept.
pub async fn import_bundle(registry: &Registry, bundle: &Bundle) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    for id in &bundle.registration_order {
        let Some(incoming) = bundle.protocols.iter().find(|p| &p.id == id) else {
            continue;
        };
        match registry.get(id).await {
            Some(existing) => {
                let resolution = resolve_conflict(&existing, incoming);
                match resolution.winner {
                    ConflictWinner::Remote => match registry.update(incoming.clone()).await {
                        Ok(()) => report.overwritten.push(id.clone()),
                        Err(err) => report.failed.push((id.clone(), err.to_string())),
                    },
                    ConflictWinner::Local => report.kept_local.push(id.clone()),
                }
            }
            None => match registry.register(incoming.clone()).await {
                Ok(()) => report.registered.push(id.clone()),
                Err(err) => {
                    warn!(protocol_id = %id, error = %err, "failed to import protocol from bundle");
                    report.failed.push((id.clone(), err.to_string()));
                }
            },
        }
    }
    Ok(report)
}

/// Discovers peers from the sync transport's known-instances map plus any
/// previously-registered peer the caller has manually added.
pub async fn discover_peers(paths: &OrchestratorPaths, known: Vec<InstanceRecord>) -> Result<Vec<Peer>> {
    let mut peers: Vec<Peer> = known.into_iter().map(Peer::from).collect();
    if let Ok(raw) = fs::read_to_string(paths.distribution_peers_file()).await {
        if let Ok(persisted) = serde_json::from_str::<Vec<Peer>>(&raw) {
            for peer in persisted {
                if !peers.iter().any(|p| p.instance_id == peer.instance_id) {
                    peers.push(peer);
                }
            }
        }
    }
    write_json_atomic(&paths.distribution_peers_file(), &peers).await?;
    Ok(peers)
}

pub async fn register_peer(project_dir: &Path, peer: Peer) -> Result<()> {
    let paths = OrchestratorPaths::new(project_dir);
    let mut peers: Vec<Peer> = match fs::read_to_string(paths.distribution_peers_file()).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    if let Some(existing) = peers.iter_mut().find(|p| p.instance_id == peer.instance_id) {
        *existing = peer;
    } else {
        peers.push(peer);
    }
    write_json_atomic(&paths.distribution_peers_file(), &peers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::{Constraint, ConstraintRule, EnforcementConfig, EnforcementMode, OnViolation, Severity, ToolRestrictionRule};

    fn protocol(id: &str, version: &str, requires: Vec<&str>) -> Protocol {
        Protocol {
            id: id.to_string(),
            version: version.to_string(),
            name: id.to_string(),
            description: None,
            extends: Vec::new(),
            requires: requires.into_iter().map(String::from).collect(),
            conflicts: Vec::new(),
            constraints: vec![Constraint {
                id: "c1".to_string(),
                severity: Severity::Info,
                message: "m".to_string(),
                enabled: true,
                conditions: None,
                rule: ConstraintRule::ToolRestriction(ToolRestrictionRule::default()),
            }],
            enforcement: EnforcementConfig {
                mode: EnforcementMode::Audit,
                on_violation: OnViolation::Log,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority: 10,
            tags: None,
            enabled: false,
            deprecated: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn export_then_import_round_trips_a_bundle() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_registry = Registry::new(src_dir.path());
        let src_paths = OrchestratorPaths::new(src_dir.path());
        src_registry.register(protocol("base", "1.0.0", vec![])).await.unwrap();
        src_registry.register(protocol("dependent", "1.0.0", vec!["base"])).await.unwrap();

        let bundle = export_bundle(&src_registry, &src_paths, None).await.unwrap();
        assert_eq!(bundle.registration_order, vec!["base".to_string(), "dependent".to_string()]);

        let dst_dir = tempfile::tempdir().unwrap();
        let dst_registry = Registry::new(dst_dir.path());
        let report = import_bundle(&dst_registry, &bundle).await.unwrap();
        assert_eq!(report.registered.len(), 2);
        assert!(dst_registry.get("dependent").await.is_some());
    }

    #[tokio::test]
    async fn import_keeps_local_when_local_version_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.register(protocol("p", "2.0.0", vec![])).await.unwrap();

        let bundle = Bundle {
            bundle_id: "b1".to_string(),
            created_at: Utc::now(),
            protocols: vec![protocol("p", "1.0.0", vec![])],
            registration_order: vec!["p".to_string()],
        };
        let report = import_bundle(&registry, &bundle).await.unwrap();
        assert_eq!(report.kept_local, vec!["p".to_string()]);
        assert_eq!(registry.get("p").await.unwrap().version, "2.0.0");
    }

    #[tokio::test]
    async fn import_overwrites_when_remote_version_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.register(protocol("p", "1.0.0", vec![])).await.unwrap();

        let bundle = Bundle {
            bundle_id: "b1".to_string(),
            created_at: Utc::now(),
            protocols: vec![protocol("p", "2.0.0", vec![])],
            registration_order: vec!["p".to_string()],
        };
        let report = import_bundle(&registry, &bundle).await.unwrap();
        assert_eq!(report.overwritten, vec!["p".to_string()]);
        assert_eq!(registry.get("p").await.unwrap().version, "2.0.0");
    }
}
