use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use loom_core::atomic::write_json_atomic;
use loom_core::event_bus::{EngineEvent, EventBus};
use loom_core::paths::OrchestratorPaths;
use loom_types::{Protocol, SyncEnvelope, SyncMessage, VectorOrdering, VersionVector};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::Registry;

const DEFAULT_HEARTBEAT_PERIOD_SECS: u64 = 30;
const DEFAULT_MESSAGE_RETENTION_SECS: i64 = 300;
const DEFAULT_INSTANCE_TIMEOUT_SECS: i64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub project_dir: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictWinner {
    Remote,
    Local,
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub winner: ConflictWinner,
    pub reason: String,
}

/// (1) higher protocol.version wins; (2) else later updatedAt||createdAt
/// wins; (3) else local keeps its version. Used when the version vectors
/// compare as `concurrent`, or `equal` with differing content.
pub fn resolve_conflict(local: &Protocol, remote: &Protocol) -> ConflictResolution {
    let local_ver = Protocol::parse_semver(&local.version);
    let remote_ver = Protocol::parse_semver(&remote.version);
    match (local_ver, remote_ver) {
        (Some(l), Some(r)) if l != r => {
            return ConflictResolution {
                winner: if r > l { ConflictWinner::Remote } else { ConflictWinner::Local },
                reason: format!("protocol version {} vs {}", remote.version, local.version),
            };
        }
        _ => {}
    }
    let local_stamp = local.updated_at.unwrap_or(local.created_at);
    let remote_stamp = remote.updated_at.unwrap_or(remote.created_at);
    if remote_stamp != local_stamp {
        return ConflictResolution {
            winner: if remote_stamp > local_stamp {
                ConflictWinner::Remote
            } else {
                ConflictWinner::Local
            },
            reason: "later updatedAt/createdAt wins".to_string(),
        };
    }
    ConflictResolution {
        winner: ConflictWinner::Local,
        reason: "versions and timestamps tied; local side keeps its version".to_string(),
    }
}

/// File-transport message bus for multi-instance protocol sync: one shared
/// directory of instance files and one of message envelopes, all written
/// with the atomic temp+rename pattern.
pub struct SyncManager {
    paths: OrchestratorPaths,
    instance_id: String,
    vector: RwLock<VersionVector>,
    known_instances: RwLock<HashMap<String, InstanceRecord>>,
    pending_acks: RwLock<HashMap<String, (DateTime<Utc>, u32)>>,
    processed: RwLock<HashSet<String>>,
    event_bus: EventBus,
}

impl SyncManager {
    pub fn new(project_dir: &Path, event_bus: EventBus) -> Self {
        let instance_id = loom_types::hex_id_32();
        Self {
            paths: OrchestratorPaths::new(project_dir),
            vector: RwLock::new(VersionVector::starting_at(&instance_id)),
            known_instances: RwLock::new(HashMap::new()),
            pending_acks: RwLock::new(HashMap::new()),
            processed: RwLock::new(HashSet::new()),
            event_bus,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn envelope(&self, sequence_number: u64) -> SyncEnvelope {
        SyncEnvelope {
            message_id: Uuid::new_v4().to_string(),
            source_instance: self.instance_id.clone(),
            target_instance: None,
            timestamp: Utc::now(),
            sequence_number,
        }
    }

    /// Writes the own instance file and broadcasts one `sync_request`.
    pub async fn start(&self) -> Result<()> {
        self.write_own_instance_file().await?;
        let vector = self.vector.read().await.clone();
        let sequence_number = vector.get(&self.instance_id);
        let message = SyncMessage::SyncRequest {
            envelope: self.envelope(sequence_number),
            requested_protocols: None,
            current_version_vector: vector,
        };
        self.broadcast(message).await?;
        info!(instance = %self.instance_id, "sync manager started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = fs::remove_file(self.paths.sync_instance_file(&self.instance_id)).await;
        Ok(())
    }

    async fn write_own_instance_file(&self) -> Result<()> {
        let record = InstanceRecord {
            instance_id: self.instance_id.clone(),
            project_dir: self.paths.root.display().to_string(),
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec!["protocol_sync".to_string()],
        };
        write_json_atomic(&self.paths.sync_instance_file(&self.instance_id), &record).await
    }

    pub async fn broadcast(&self, message: SyncMessage) -> Result<()> {
        let file_name = format!(
            "{}_{}.json",
            message.envelope().timestamp.to_rfc3339(),
            message.envelope().message_id
        );
        write_json_atomic(&self.paths.sync_messages_dir().join(file_name), &message).await?;
        if matches!(message, SyncMessage::ProtocolUpdate { .. } | SyncMessage::ProtocolDelete { .. } | SyncMessage::ActivationChange { .. }) {
            self.pending_acks
                .write()
                .await
                .insert(message.envelope().message_id.clone(), (Utc::now(), 0));
        }
        self.event_bus.publish(EngineEvent::new(
            "sync.broadcast",
            serde_json::json!({"messageId": message.envelope().message_id}),
        ));
        Ok(())
    }

    /// Increments `v[self]` strictly, then broadcasts a `protocol_update`.
    pub async fn broadcast_protocol_update(&self, protocol: Protocol, previous_version: Option<String>) -> Result<()> {
        let mut vector = self.vector.write().await;
        vector.increment(&self.instance_id);
        let sequence_number = vector.get(&self.instance_id);
        let snapshot = vector.clone();
        drop(vector);
        let message = SyncMessage::ProtocolUpdate {
            envelope: self.envelope(sequence_number),
            protocol,
            version_vector: snapshot,
            previous_version,
        };
        self.broadcast(message).await
    }

    /// Applies an incoming envelope's version vector against the local one
    /// and returns whether it should be accepted (not already known-after).
    pub async fn receive_version_vector(&self, remote: &VersionVector) -> VectorOrdering {
        let mut local = self.vector.write().await;
        let ordering = local.compare(remote);
        if ordering != VectorOrdering::After {
            local.merge(remote);
        }
        ordering
    }

    pub async fn handle_heartbeat(&self, instance: String, protocol_count: usize, active_count: usize) {
        let mut known = self.known_instances.write().await;
        known
            .entry(instance.clone())
            .and_modify(|record| record.last_heartbeat = Utc::now())
            .or_insert(InstanceRecord {
                instance_id: instance,
                project_dir: String::new(),
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                version: String::new(),
                capabilities: Vec::new(),
            });
        let _ = (protocol_count, active_count);
    }

    pub async fn handle_ack(&self, in_response_to: &str) {
        self.pending_acks.write().await.remove(in_response_to);
    }

    /// Scans `messages/` for envelopes not yet processed and not authored
    /// by this instance, applies each against `registry` per the §4.7
    /// message-flow table, and writes the ack/nack response. Each message
    /// is applied at most once (tracked by `messageId`, matching the
    /// completion monitor's per-worker "already reported" dedup in spirit).
    pub async fn process_inbox(&self, registry: &Registry) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        let mut entries = match fs::read_dir(self.paths.sync_messages_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(applied),
        };
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            paths.push(entry.path());
        }
        for path in paths {
            let Ok(raw) = fs::read_to_string(&path).await else { continue };
            let message: SyncMessage = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping corrupt sync message");
                    continue;
                }
            };
            let envelope = message.envelope().clone();
            if envelope.source_instance == self.instance_id {
                continue;
            }
            if !self.processed.write().await.insert(envelope.message_id.clone()) {
                continue;
            }
            if self.apply_message(registry, message).await? {
                applied.push(envelope.message_id);
            }
        }
        Ok(applied)
    }

    /// Applies one inbound message; returns whether it changed local state.
    async fn apply_message(&self, registry: &Registry, message: SyncMessage) -> Result<bool> {
        match message {
            SyncMessage::ProtocolUpdate { envelope, protocol, version_vector, .. } => {
                let ordering = self.receive_version_vector(&version_vector).await;
                if ordering == VectorOrdering::After {
                    self.send_nack(&envelope, "outdated").await?;
                    return Ok(false);
                }
                let accepted = match registry.get(&protocol.id).await {
                    Some(existing) => {
                        let resolution = resolve_conflict(&existing, &protocol);
                        if resolution.winner == ConflictWinner::Remote {
                            registry.update(protocol).await?;
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        registry.register(protocol).await?;
                        true
                    }
                };
                self.send_ack(&envelope, "applied").await?;
                Ok(accepted)
            }
            SyncMessage::ProtocolDelete { envelope, id, version_vector, .. } => {
                self.receive_version_vector(&version_vector).await;
                let _ = registry.delete(&id).await;
                self.send_ack(&envelope, "applied").await?;
                Ok(true)
            }
            SyncMessage::ActivationChange { envelope, id, active, version_vector } => {
                self.receive_version_vector(&version_vector).await;
                let result = if active { registry.activate(&id).await } else { registry.deactivate(&id).await };
                self.send_ack(&envelope, if result.is_ok() { "applied" } else { "rejected" }).await?;
                Ok(result.is_ok())
            }
            SyncMessage::SyncRequest { envelope, .. } => {
                let protocols = registry.list().await;
                let active_protocols = registry.active_ids().await;
                let version_vector = self.version_vector().await;
                let response = SyncMessage::SyncResponse {
                    envelope: self.envelope(version_vector.get(&self.instance_id)),
                    protocols,
                    active_protocols,
                    version_vector,
                    in_response_to: envelope.message_id,
                };
                self.broadcast(response).await?;
                Ok(false)
            }
            SyncMessage::SyncResponse { protocols, version_vector, .. } => {
                self.receive_version_vector(&version_vector).await;
                let mut changed = false;
                for protocol in protocols {
                    match registry.get(&protocol.id).await {
                        Some(existing) => {
                            if resolve_conflict(&existing, &protocol).winner == ConflictWinner::Remote {
                                registry.update(protocol).await?;
                                changed = true;
                            }
                        }
                        None => {
                            registry.register(protocol).await?;
                            changed = true;
                        }
                    }
                }
                Ok(changed)
            }
            SyncMessage::Heartbeat { instance, protocol_count, active_count, .. } => {
                self.handle_heartbeat(instance, protocol_count, active_count).await;
                Ok(false)
            }
            SyncMessage::Ack { in_response_to, .. } => {
                self.handle_ack(&in_response_to).await;
                Ok(false)
            }
            SyncMessage::Nack { in_response_to, reason, .. } => {
                warn!(message_id = %in_response_to, reason = %reason, "peer nacked a sync message");
                self.handle_ack(&in_response_to).await;
                Ok(false)
            }
        }
    }

    async fn send_ack(&self, in_response_to: &SyncEnvelope, status: &str) -> Result<()> {
        let sequence_number = self.version_vector().await.get(&self.instance_id);
        let mut envelope = self.envelope(sequence_number);
        envelope.target_instance = Some(in_response_to.source_instance.clone());
        self.broadcast(SyncMessage::Ack {
            envelope,
            in_response_to: in_response_to.message_id.clone(),
            status: status.to_string(),
        })
        .await
    }

    async fn send_nack(&self, in_response_to: &SyncEnvelope, reason: &str) -> Result<()> {
        let sequence_number = self.version_vector().await.get(&self.instance_id);
        let mut envelope = self.envelope(sequence_number);
        envelope.target_instance = Some(in_response_to.source_instance.clone());
        self.broadcast(SyncMessage::Nack {
            envelope,
            in_response_to: in_response_to.message_id.clone(),
            reason: reason.to_string(),
        })
        .await
    }

    /// Drops and logs pending-ack entries past `max_retries * retry_delay`.
    pub async fn sweep_pending_acks(&self, max_retries: u32, retry_delay: StdDuration) {
        let deadline = Duration::milliseconds((retry_delay.as_millis() as i64) * max_retries as i64);
        let now = Utc::now();
        let mut pending = self.pending_acks.write().await;
        pending.retain(|message_id, (sent_at, _)| {
            let expired = now - *sent_at > deadline;
            if expired {
                warn!(message_id, "pending ack exceeded max retries, dropping");
            }
            !expired
        });
    }

    /// Sweeps message files older than `retention` and instance files
    /// without a heartbeat within `instance_timeout`.
    pub async fn cleanup(&self, retention: StdDuration, instance_timeout: StdDuration) -> Result<()> {
        let retention = Duration::seconds(retention.as_secs() as i64);
        let cutoff = Utc::now() - retention;
        if let Ok(mut entries) = fs::read_dir(self.paths.sync_messages_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(metadata) = entry.metadata().await {
                    if let Ok(modified) = metadata.modified() {
                        let modified: DateTime<Utc> = modified.into();
                        if modified < cutoff {
                            let _ = fs::remove_file(entry.path()).await;
                        }
                    }
                }
            }
        }

        let instance_timeout = Duration::seconds(instance_timeout.as_secs() as i64);
        let instance_cutoff = Utc::now() - instance_timeout;
        let mut known = self.known_instances.write().await;
        let dead: Vec<String> = known
            .iter()
            .filter(|(_, record)| record.last_heartbeat < instance_cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            known.remove(&id);
            let _ = fs::remove_file(self.paths.sync_instance_file(&id)).await;
        }
        Ok(())
    }

    pub async fn known_instances(&self) -> Vec<InstanceRecord> {
        self.known_instances.read().await.values().cloned().collect()
    }

    pub async fn version_vector(&self) -> VersionVector {
        self.vector.read().await.clone()
    }

    pub fn heartbeat_period(&self) -> StdDuration {
        StdDuration::from_secs(DEFAULT_HEARTBEAT_PERIOD_SECS)
    }

    pub fn message_retention(&self) -> StdDuration {
        StdDuration::from_secs(DEFAULT_MESSAGE_RETENTION_SECS as u64)
    }

    pub fn instance_timeout(&self) -> StdDuration {
        StdDuration::from_secs(DEFAULT_INSTANCE_TIMEOUT_SECS as u64)
    }

    /// Spawns the heartbeat/cleanup tickers as background tasks bound to
    /// this manager's lifetime via an `Arc`. Intended to be called once
    /// from the Session Controller's `start()`.
    pub fn spawn_tickers(self: std::sync::Arc<Self>) {
        let heartbeat_self = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(heartbeat_self.heartbeat_period());
            loop {
                ticker.tick().await;
                if let Err(err) = heartbeat_self.write_own_instance_file().await {
                    warn!(error = %err, "failed to refresh instance heartbeat file");
                }
            }
        });
        let cleanup_self = self.clone();
        tokio::spawn(async move {
            let period = cleanup_self.message_retention() / 2;
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = cleanup_self
                    .cleanup(cleanup_self.message_retention(), cleanup_self.instance_timeout())
                    .await
                {
                    warn!(error = %err, "sync cleanup tick failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::event_bus::EventBus;
    use loom_types::{EnforcementConfig, EnforcementMode, OnViolation};

    fn protocol(version: &str) -> Protocol {
        Protocol {
            id: "p1".to_string(),
            version: version.to_string(),
            name: "p1".to_string(),
            description: None,
            extends: Vec::new(),
            requires: Vec::new(),
            conflicts: Vec::new(),
            constraints: Vec::new(),
            enforcement: EnforcementConfig {
                mode: EnforcementMode::Permissive,
                on_violation: OnViolation::Warn,
                ..Default::default()
            },
            applicable_contexts: Default::default(),
            priority: 0,
            tags: None,
            enabled: true,
            deprecated: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn higher_version_wins_conflict() {
        let local = protocol("1.0.0");
        let remote = protocol("2.0.0");
        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, ConflictWinner::Remote);
    }

    #[test]
    fn tied_version_and_timestamp_keeps_local() {
        let local = protocol("1.0.0");
        let mut remote = protocol("1.0.0");
        remote.created_at = local.created_at;
        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, ConflictWinner::Local);
    }

    #[tokio::test]
    async fn start_writes_instance_file_and_broadcasts_sync_request() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncManager::new(dir.path(), EventBus::new());
        manager.start().await.unwrap();
        let instance_file = manager.paths.sync_instance_file(manager.instance_id());
        assert!(instance_file.exists());
        let mut messages = fs::read_dir(manager.paths.sync_messages_dir()).await.unwrap();
        assert!(messages.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn broadcast_protocol_update_increments_local_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncManager::new(dir.path(), EventBus::new());
        let before = manager.version_vector().await.get(manager.instance_id());
        manager.broadcast_protocol_update(protocol("1.0.0"), None).await.unwrap();
        let after = manager.version_vector().await.get(manager.instance_id());
        assert_eq!(after, before + 1);
    }
}
