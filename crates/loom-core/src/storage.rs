use std::path::Path;

use anyhow::{Context, Result};
use loom_types::Session;
use tokio::fs;
use tracing::warn;

use crate::atomic::write_json_atomic;
use crate::paths::OrchestratorPaths;

const MAX_VIOLATIONS: usize = 1000;
const MAX_AUDIT_LOG: usize = 5000;

/// Durable, crash-safe record of the session. A corrupted state file is
/// treated as "no session" rather than an error: a crashed session must
/// never block re-initialisation.
pub struct Storage {
    paths: OrchestratorPaths,
}

impl Storage {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            paths: OrchestratorPaths::new(project_dir),
        }
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    pub async fn load(&self) -> Option<Session> {
        let raw = match fs::read_to_string(self.paths.state_file()).await {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(error = %err, "state file is corrupt, treating as no session");
                None
            }
        }
    }

    /// Persists the session atomically and mirrors a human-readable
    /// progress file. Every multi-field mutation by any other component
    /// must go through one `load -> mutate -> save` cycle.
    pub async fn save(&self, session: &Session) -> Result<()> {
        write_json_atomic(&self.paths.state_file(), session)
            .await
            .context("writing state.json")?;
        self.write_progress_mirror(session).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let _ = fs::remove_file(self.paths.state_file()).await;
        let _ = fs::remove_file(self.paths.progress_file()).await;
        Ok(())
    }

    async fn write_progress_mirror(&self, session: &Session) -> Result<()> {
        let mut body = format!(
            "session: {} [{:?}]\ntask: {}\n\n",
            session.project_dir.display(),
            session.status,
            session.task_description
        );
        for line in &session.progress_log {
            body.push_str(line);
            body.push('\n');
        }
        if let Some(parent) = self.paths.progress_file().parent() {
            fs::create_dir_all(parent).await.ok();
        }
        fs::write(self.paths.progress_file(), body)
            .await
            .context("writing progress.txt")
    }

    /// Writes a generated bootstrap script that recreates the orchestrator
    /// directory layout; idempotent, safe to re-run.
    pub async fn write_init_script(&self) -> Result<()> {
        let script = format!(
            "#!/usr/bin/env bash\nset -euo pipefail\nmkdir -p {workers} {protocols}/distribution/exports {proposals} {sync}/instances {sync}/messages\n",
            workers = self.paths.workers_dir().display(),
            protocols = self.paths.protocols_dir().display(),
            proposals = self.paths.proposals_dir().display(),
            sync = self.paths.sync_dir().display(),
        );
        crate::atomic::write_bytes_atomic(&self.paths.init_script(), script.as_bytes()).await
    }
}

/// Truncates a FIFO-bounded array to its invariant cap, dropping the oldest
/// entries, before the owning document is written.
pub fn truncate_bounded<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let drop_count = items.len() - cap;
        items.drain(0..drop_count);
    }
}

pub const MAX_VIOLATIONS_CAP: usize = MAX_VIOLATIONS;
pub const MAX_AUDIT_LOG_CAP: usize = MAX_AUDIT_LOG;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_returns_none_when_no_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.load().await.is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let session = Session::new(dir.path().to_path_buf(), "build a thing");
        storage.save(&session).await.unwrap();
        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.task_description, "build a thing");
    }

    #[tokio::test]
    async fn corrupt_state_file_is_treated_as_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        fs::create_dir_all(storage.paths().root.clone())
            .await
            .unwrap();
        fs::write(storage.paths().state_file(), b"{not valid json")
            .await
            .unwrap();
        assert!(storage.load().await.is_none());
    }

    #[test]
    fn truncate_bounded_drops_oldest_entries() {
        let mut items: Vec<u32> = (0..1200).collect();
        truncate_bounded(&mut items, MAX_VIOLATIONS_CAP);
        assert_eq!(items.len(), MAX_VIOLATIONS_CAP);
        assert_eq!(items[0], 200);
    }

    #[tokio::test]
    async fn write_init_script_creates_layout_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.write_init_script().await.unwrap();
        let contents = fs::read_to_string(storage.paths().init_script())
            .await
            .unwrap();
        assert!(contents.contains("mkdir -p"));
    }
}
