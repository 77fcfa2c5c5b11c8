use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Protocol;

/// Per-instance mapping from instance id to a monotonic sequence number,
/// used for causal ordering of sync messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(pub BTreeMap<String, u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

impl VersionVector {
    pub fn starting_at(self_id: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(self_id.to_string(), 0);
        Self(map)
    }

    pub fn increment(&mut self, instance_id: &str) {
        *self.0.entry(instance_id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, instance_id: &str) -> u64 {
        self.0.get(instance_id).copied().unwrap_or(0)
    }

    /// Componentwise max merge; never decreases any component.
    pub fn merge(&mut self, other: &VersionVector) {
        for (id, seq) in &other.0 {
            let entry = self.0.entry(id.clone()).or_insert(0);
            if *seq > *entry {
                *entry = *seq;
            }
        }
    }

    /// Causal-order comparison of two vectors.
    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;
        let mut ids: std::collections::BTreeSet<&String> = self.0.keys().collect();
        ids.extend(other.0.keys());
        for id in ids {
            let a = self.get(id);
            let b = other.get(id);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }
        match (self_ahead, other_ahead) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::After,
            (false, true) => VectorOrdering::Before,
            (true, true) => VectorOrdering::Concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub message_id: String,
    pub source_instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_instance: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    ProtocolUpdate {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        protocol: Protocol,
        version_vector: VersionVector,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_version: Option<String>,
    },
    ProtocolDelete {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        id: String,
        version_vector: VersionVector,
        deleted_at: DateTime<Utc>,
    },
    ActivationChange {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        id: String,
        active: bool,
        version_vector: VersionVector,
    },
    SyncRequest {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_protocols: Option<Vec<String>>,
        current_version_vector: VersionVector,
    },
    SyncResponse {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        protocols: Vec<Protocol>,
        active_protocols: Vec<String>,
        version_vector: VersionVector,
        in_response_to: String,
    },
    Heartbeat {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        instance: String,
        protocol_count: usize,
        active_count: usize,
    },
    Ack {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        in_response_to: String,
        status: String,
    },
    Nack {
        #[serde(flatten)]
        envelope: SyncEnvelope,
        in_response_to: String,
        reason: String,
    },
}

impl SyncMessage {
    pub fn envelope(&self) -> &SyncEnvelope {
        match self {
            SyncMessage::ProtocolUpdate { envelope, .. }
            | SyncMessage::ProtocolDelete { envelope, .. }
            | SyncMessage::ActivationChange { envelope, .. }
            | SyncMessage::SyncRequest { envelope, .. }
            | SyncMessage::SyncResponse { envelope, .. }
            | SyncMessage::Heartbeat { envelope, .. }
            | SyncMessage::Ack { envelope, .. }
            | SyncMessage::Nack { envelope, .. } => envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_when_both_sides_advanced() {
        let mut a = VersionVector::starting_at("a");
        a.increment("a");
        let mut b = VersionVector::starting_at("b");
        b.increment("b");
        assert_eq!(a.compare(&b), VectorOrdering::Concurrent);
    }

    #[test]
    fn merge_never_decreases_components() {
        let mut a = VersionVector::starting_at("a");
        a.increment("a");
        a.increment("a");
        let b = VersionVector::starting_at("a");
        a.merge(&b);
        assert_eq!(a.get("a"), 2);
    }

    #[test]
    fn after_when_strictly_ahead() {
        let mut a = VersionVector::starting_at("a");
        let b = a.clone();
        a.increment("a");
        assert_eq!(a.compare(&b), VectorOrdering::After);
        assert_eq!(b.compare(&a), VectorOrdering::Before);
    }
}
