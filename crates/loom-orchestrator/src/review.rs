use std::path::Path;

use anyhow::{bail, Result};
use loom_core::paths::OrchestratorPaths;
use loom_runtime::{WorkerLauncher, WorkerManager};
use loom_types::{Feature, ReviewConfig, Session, Worker, WorkerStatus};
use serde_json::{json, Value};

/// Review workers operate over the whole session rather than one feature
/// (§4.3: "spawns a reviewer operating over the whole session"), but the
/// Worker Manager keys its done/log/plan files by a feature id. These
/// synthetic ids give each review kind a stable, collision-free key.
pub fn code_review_key() -> &'static str {
    "__review_code__"
}

pub fn arch_review_key() -> &'static str {
    "__review_architecture__"
}

/// Starts the reviewer(s) enabled by `config`, skipping kinds that already
/// have a worker recorded on `existing` (idempotent against a retried
/// `review_run`).
pub async fn start_review_workers(
    project_dir: &Path,
    task_description: &str,
    config: &ReviewConfig,
    existing: &[Worker],
    workers: &WorkerManager,
    launcher: &dyn WorkerLauncher,
) -> Result<Vec<Worker>> {
    let mut started = Vec::new();

    if config.code_review && !existing.iter().any(|w| w.feature_id == code_review_key()) {
        let synthetic = Feature::new(code_review_key(), task_description);
        workers.start_review_worker(project_dir, &synthetic, false, launcher).await?;
        started.push(synthetic.id);
    }
    if config.arch_review && !existing.iter().any(|w| w.feature_id == arch_review_key()) {
        let synthetic = Feature::new(arch_review_key(), task_description);
        workers.start_review_worker(project_dir, &synthetic, true, launcher).await?;
        started.push(synthetic.id);
    }

    let snapshot = workers.snapshot().await;
    Ok(snapshot.into_iter().filter(|w| started.contains(&w.feature_id)).collect())
}

/// Whether every worker in `review_workers` has reached a terminal status,
/// per the current snapshot (I8: `aggregatedReview` is set iff all review
/// workers reached a terminal state).
pub fn all_terminal(review_workers: &[Worker]) -> bool {
    !review_workers.is_empty()
        && review_workers.iter().all(|w| matches!(w.status, WorkerStatus::Completed | WorkerStatus::Crashed))
}

/// Builds the aggregated review document once all reviewers are terminal:
/// one entry per reviewer with its outcome and the contents of its done
/// file (the reviewer's free-form findings).
pub async fn aggregate_review(paths: &OrchestratorPaths, workers: &WorkerManager, review_workers: &[Worker]) -> Value {
    let mut entries = Vec::new();
    for worker in review_workers {
        // `poll_completions`/`check_worker` key every side-file by the
        // worker's own `sessionName`, not the synthetic feature id used to
        // spawn it; follow the same convention here.
        let notes = workers.read_done_file(paths, &worker.session_name).await;
        entries.push(json!({
            "role": worker.role,
            "sessionName": worker.session_name,
            "status": worker.status,
            "notes": notes,
        }));
    }
    json!({ "reviewers": entries })
}

/// Attaches implementer-facing notes to a feature and resets it to
/// `pending` so the scheduler can re-dispatch it, per `review_implement_suggestions`.
pub fn apply_review_suggestions(session: &mut Session, feature_id: &str, notes: Value) -> Result<()> {
    let feature = session
        .features
        .iter_mut()
        .find(|f| f.id == feature_id)
        .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
    if session.review_config.is_none() {
        bail!("reviews are not configured for this session");
    }
    feature.context = Some(match feature.context.take() {
        Some(existing) => json!({"previous": existing, "reviewSuggestions": notes}),
        None => json!({"reviewSuggestions": notes}),
    });
    feature.status = loom_types::FeatureStatus::Pending;
    feature.worker_id = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loom_types::WorkerRole;

    fn worker(feature_id: &str, status: WorkerStatus) -> Worker {
        Worker {
            session_name: format!("{feature_id}-session"),
            feature_id: feature_id.to_string(),
            role: WorkerRole::CodeReviewer,
            status,
            started_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn all_terminal_is_false_with_no_workers() {
        assert!(!all_terminal(&[]));
    }

    #[test]
    fn all_terminal_requires_every_worker_terminal() {
        let workers = vec![worker("a", WorkerStatus::Completed), worker("b", WorkerStatus::Running)];
        assert!(!all_terminal(&workers));
    }

    #[test]
    fn all_terminal_accepts_crashed_as_terminal() {
        let workers = vec![worker("a", WorkerStatus::Completed), worker("b", WorkerStatus::Crashed)];
        assert!(all_terminal(&workers));
    }

    #[test]
    fn apply_review_suggestions_resets_feature_and_attaches_notes() {
        let mut session = Session::new(std::path::PathBuf::from("/tmp/p"), "task");
        session.review_config = Some(ReviewConfig::default());
        let mut feature = Feature::new("f1", "do it");
        feature.status = loom_types::FeatureStatus::Completed;
        session.features.push(feature);
        apply_review_suggestions(&mut session, "f1", json!({"fix": "add tests"})).unwrap();
        let feature = &session.features[0];
        assert_eq!(feature.status, loom_types::FeatureStatus::Pending);
        assert!(feature.context.is_some());
    }

    #[test]
    fn apply_review_suggestions_rejects_unconfigured_session() {
        let mut session = Session::new(std::path::PathBuf::from("/tmp/p"), "task");
        session.features.push(Feature::new("f1", "do it"));
        assert!(apply_review_suggestions(&mut session, "f1", json!({})).is_err());
    }
}
