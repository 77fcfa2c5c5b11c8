use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use loom_core::event_bus::{EngineEvent, EventBus};
use loom_core::paths::OrchestratorPaths;
use loom_types::{Feature, FeatureStatus, Worker, WorkerRole, WorkerStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::heartbeat::{extract_heartbeat, Heartbeat};
use crate::launcher::WorkerLauncher;
use crate::process::ProcessAdapter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCheck {
    pub status: WorkerStatus,
    pub output: String,
}

/// Lifecycle of workers for features, planners, voters and reviewers.
/// Owns the `Worker` entities (keyed by `sessionName`); the Session
/// Controller actor is responsible for mirroring `snapshot()` into the
/// persisted `Session.workers` on every save.
pub struct WorkerManager {
    process: ProcessAdapter,
    event_bus: EventBus,
    workers: Arc<RwLock<std::collections::HashMap<String, Worker>>>,
    reported: Arc<RwLock<HashSet<String>>>,
}

impl WorkerManager {
    pub fn new(process: ProcessAdapter, event_bus: EventBus) -> Self {
        Self {
            process,
            event_bus,
            workers: Arc::new(RwLock::new(std::collections::HashMap::new())),
            reported: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    fn dependencies_met(feature: &Feature, all: &[Feature]) -> bool {
        feature.depends_on.iter().all(|dep_id| {
            all.iter()
                .any(|f| &f.id == dep_id && f.status == FeatureStatus::Completed)
        })
    }

    async fn spawn_for_role(
        &self,
        project_dir: &Path,
        feature: &Feature,
        role: WorkerRole,
        custom_prompt: Option<&str>,
        model_hint: Option<&str>,
        launcher: &dyn WorkerLauncher,
    ) -> Result<String> {
        let session_name = format!("{}-{}-{}", feature.id, role.label(), short_suffix());
        let argv = launcher.build_argv(&role, feature, custom_prompt, model_hint);
        self.process
            .spawn_session(&session_name, &project_dir.to_path_buf(), &argv)
            .await?;

        let now = Utc::now();
        self.workers.write().await.insert(
            session_name.clone(),
            Worker {
                session_name: session_name.clone(),
                feature_id: feature.id.clone(),
                role,
                status: WorkerStatus::Running,
                started_at: now,
                last_seen_at: now,
            },
        );
        Ok(session_name)
    }

    /// Starts the primary implementor worker for `feature`. Mutates
    /// `feature` in place; the caller is responsible for persisting the
    /// owning session afterwards.
    pub async fn start_worker(
        &self,
        project_dir: &Path,
        feature: &mut Feature,
        all_features: &[Feature],
        custom_prompt: Option<&str>,
        model_hint: Option<&str>,
        launcher: &dyn WorkerLauncher,
    ) -> Result<String> {
        if feature.status == FeatureStatus::InProgress || feature.status == FeatureStatus::Completed {
            bail!(
                "cannot start worker for feature {} in status {:?}",
                feature.id,
                feature.status
            );
        }
        if !Self::dependencies_met(feature, all_features) {
            bail!("dependencies not met for feature {}", feature.id);
        }

        let session_name = self
            .spawn_for_role(
                project_dir,
                feature,
                WorkerRole::Implementor,
                custom_prompt,
                model_hint,
                launcher,
            )
            .await?;

        feature.worker_id = Some(session_name.clone());
        feature.started_at = Some(Utc::now());
        feature.status = FeatureStatus::InProgress;
        feature.attempts += 1;
        self.event_bus.publish(EngineEvent::new(
            "worker.started",
            json!({"featureId": feature.id, "sessionName": session_name}),
        ));
        Ok(session_name)
    }

    pub async fn start_planner_worker(
        &self,
        project_dir: &Path,
        feature: &Feature,
        role_a: bool,
        custom_prompt: Option<&str>,
        launcher: &dyn WorkerLauncher,
    ) -> Result<String> {
        let role = if role_a {
            WorkerRole::PlannerA
        } else {
            WorkerRole::PlannerB
        };
        self.spawn_for_role(project_dir, feature, role, custom_prompt, None, launcher)
            .await
    }

    pub async fn start_voting_worker(
        &self,
        project_dir: &Path,
        feature: &Feature,
        voter_index: u8,
        custom_prompt: Option<&str>,
        launcher: &dyn WorkerLauncher,
    ) -> Result<String> {
        self.spawn_for_role(
            project_dir,
            feature,
            WorkerRole::Voter(voter_index),
            custom_prompt,
            None,
            launcher,
        )
        .await
    }

    pub async fn start_review_worker(
        &self,
        project_dir: &Path,
        feature: &Feature,
        architecture: bool,
        launcher: &dyn WorkerLauncher,
    ) -> Result<String> {
        let role = if architecture {
            WorkerRole::ArchReviewer
        } else {
            WorkerRole::CodeReviewer
        };
        self.spawn_for_role(project_dir, feature, role, None, None, launcher)
            .await
    }

    pub async fn check_worker(&self, session_name: &str, last_n_lines: usize) -> Result<WorkerCheck> {
        let status = self
            .workers
            .read()
            .await
            .get(session_name)
            .map(|w| w.status.clone())
            .ok_or_else(|| anyhow!("no such worker: {session_name}"))?;
        let output = self
            .process
            .capture(session_name, last_n_lines)
            .await
            .unwrap_or_default();
        Ok(WorkerCheck { status, output })
    }

    pub async fn heartbeat(&self, session_name: &str, lines: usize) -> Result<Heartbeat> {
        let started_at = self.process.started_at(session_name).await;
        let running_for = started_at.map(|s| (Utc::now() - s).num_seconds());
        let tail = self.process.capture(session_name, lines).await.unwrap_or_default();
        Ok(extract_heartbeat(&tail, running_for))
    }

    pub async fn check_all_workers(&self) -> Vec<(String, WorkerStatus)> {
        let workers = self.workers.read().await;
        let mut out = Vec::new();
        for worker in workers.values() {
            out.push((worker.session_name.clone(), worker.status.clone()));
        }
        out
    }

    pub async fn send_message(&self, session_name: &str, text: &str) -> Result<()> {
        self.process.send_keys(session_name, text, true).await
    }

    pub async fn kill_worker(&self, session_name: &str) -> Result<()> {
        self.process.kill(session_name).await?;
        self.workers.write().await.remove(session_name);
        Ok(())
    }

    pub async fn kill_all_workers(&self) -> Vec<String> {
        let names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        for name in &names {
            let _ = self.kill_worker(name).await;
        }
        names
    }

    pub async fn read_plan_file(&self, paths: &OrchestratorPaths, worker_key: &str) -> Option<serde_json::Value> {
        let raw = fs::read_to_string(paths.worker_plan(worker_key)).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn read_done_file(&self, paths: &OrchestratorPaths, worker_key: &str) -> Option<String> {
        fs::read_to_string(paths.worker_done(worker_key)).await.ok()
    }

    pub fn analyze_feature_conflicts(features: &[Feature]) -> Vec<crate::heartbeat::FeatureConflict> {
        let pairs: Vec<(String, String)> = features
            .iter()
            .map(|f| (f.id.clone(), f.description.clone()))
            .collect();
        crate::heartbeat::analyze_feature_conflicts(&pairs)
    }

    /// Runs one pass of the completion monitor: for each live worker, checks
    /// for session disappearance (crashed) or a `.done` side-file
    /// (completed). Each transition is reported at most once, per-worker,
    /// via the "already reported" flag (P10).
    pub async fn poll_completions(&self, paths: &OrchestratorPaths) -> Vec<CompletionEvent> {
        let names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        let mut events = Vec::new();

        for name in names {
            if self.reported.read().await.contains(&name) {
                continue;
            }

            let done_path = paths.worker_done(&name);
            let done_exists = fs::metadata(&done_path).await.is_ok();
            let session_gone = !self.process.session_exists(&name).await
                || self.process.has_exited(&name).await.unwrap_or(false);

            let outcome = if done_exists {
                Some(WorkerStatus::Completed)
            } else if session_gone {
                Some(WorkerStatus::Crashed)
            } else {
                None
            };

            if let Some(status) = outcome {
                let feature_id = {
                    let mut workers = self.workers.write().await;
                    if let Some(worker) = workers.get_mut(&name) {
                        worker.status = status.clone();
                        worker.last_seen_at = Utc::now();
                        worker.feature_id.clone()
                    } else {
                        continue;
                    }
                };
                self.reported.write().await.insert(name.clone());
                self.event_bus.publish(EngineEvent::new(
                    "worker.completion",
                    json!({"sessionName": name, "featureId": feature_id, "status": status}),
                ));
                events.push(CompletionEvent {
                    session_name: name,
                    feature_id,
                    status,
                });
            }
        }
        events
    }
}

#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub session_name: String,
    pub feature_id: String,
    pub status: WorkerStatus,
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::TemplateLauncher;

    fn launcher() -> TemplateLauncher {
        TemplateLauncher::new("/bin/sh", vec!["-c".to_string(), "sleep 5".to_string()])
    }

    #[tokio::test]
    async fn start_worker_rejects_unmet_dependencies() {
        let manager = WorkerManager::new(ProcessAdapter::new(), EventBus::new());
        let mut feature = Feature::new("f-2", "second");
        feature.depends_on = vec!["f-1".to_string()];
        let all = vec![Feature::new("f-1", "first")];
        let err = manager
            .start_worker(Path::new("/tmp"), &mut feature, &all, None, None, &launcher())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dependencies not met"));
    }

    #[tokio::test]
    async fn start_worker_rejects_in_progress_feature() {
        let manager = WorkerManager::new(ProcessAdapter::new(), EventBus::new());
        let mut feature = Feature::new("f-1", "first");
        feature.status = FeatureStatus::InProgress;
        let err = manager
            .start_worker(Path::new("/tmp"), &mut feature, &[], None, None, &launcher())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot start worker"));
    }

    #[tokio::test]
    async fn start_worker_marks_feature_in_progress_and_bumps_attempts() {
        let manager = WorkerManager::new(ProcessAdapter::new(), EventBus::new());
        let mut feature = Feature::new("f-1", "first");
        let session_name = manager
            .start_worker(&std::env::temp_dir(), &mut feature, &[], None, None, &launcher())
            .await
            .unwrap();
        assert_eq!(feature.status, FeatureStatus::InProgress);
        assert_eq!(feature.attempts, 1);
        assert_eq!(feature.worker_id.as_deref(), Some(session_name.as_str()));
    }

    #[tokio::test]
    async fn poll_completions_reports_crash_at_most_once() {
        let manager = WorkerManager::new(ProcessAdapter::new(), EventBus::new());
        let mut feature = Feature::new("f-1", "first");
        manager
            .start_worker(&std::env::temp_dir(), &mut feature, &[], None, None, &launcher())
            .await
            .unwrap();
        let session_name = feature.worker_id.clone().unwrap();
        manager.process.kill(&session_name).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let paths = OrchestratorPaths::new(dir.path());

        let first = manager.poll_completions(&paths).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, WorkerStatus::Crashed);

        let second = manager.poll_completions(&paths).await;
        assert!(second.is_empty());
    }
}
