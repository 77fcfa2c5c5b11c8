use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::join_all;
use loom_core::config::{ConfigStore, EngineConfig};
use loom_core::event_bus::{EngineEvent, EventBus};
use loom_core::storage::Storage;
use loom_governance::{
    validate_feature as run_feature_validation, BaseConstraints, EvalContext, FeatureValidationReport, ProposalManager,
    Registry, SyncManager,
};
use loom_runtime::{ProcessAdapter, TemplateLauncher, WorkerManager};
use loom_types::{Feature, FeatureStatus, ReviewConfig, Session, SessionStatus};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::review;
use crate::scheduler::{self, Strategy};

/// The single logical actor owning the Session document for one project.
/// All mutations are serialised through `&mut self`-taking methods behind
/// an outer lock held by the caller (see `SessionHandle`).
pub struct SessionController {
    project_dir: PathBuf,
    storage: Storage,
    pub registry: Arc<Registry>,
    pub proposals: Arc<ProposalManager>,
    pub sync: Arc<SyncManager>,
    pub workers: Arc<WorkerManager>,
    pub event_bus: EventBus,
    launcher: TemplateLauncher,
    engine_config: EngineConfig,
}

impl SessionController {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let event_bus = EventBus::new();
        let process = ProcessAdapter::default();
        Self {
            registry: Arc::new(Registry::new(&project_dir)),
            proposals: Arc::new(ProposalManager::new(&project_dir, BaseConstraints::default())),
            sync: Arc::new(SyncManager::new(&project_dir, event_bus.clone())),
            workers: Arc::new(WorkerManager::new(process, event_bus.clone())),
            storage: Storage::new(&project_dir),
            launcher: TemplateLauncher::new("code-agent", Vec::new()),
            engine_config: EngineConfig::from_env(),
            event_bus,
            project_dir,
        }
    }

    pub async fn config(&self) -> loom_core::config::ConfigLayers {
        ConfigStore::new(&self.project_dir).load().await
    }

    /// Runs a verification command through the allow-list primitive
    /// (spec.md §4.2, §5, §6): only `{npm test, pytest, cargo test, ...}`-
    /// shaped commands are accepted, no argument may carry a shell
    /// metacharacter, the run is killed after
    /// `engineConfig.verificationTimeoutSecs` (default 300s), and captured
    /// output is capped at `engineConfig.verificationOutputCapBytes`
    /// (default 10MB).
    pub async fn verification_run(&self, argv: Vec<String>) -> Result<loom_runtime::VerificationOutcome> {
        loom_runtime::run_verification(
            &self.project_dir,
            &argv,
            self.engine_config.verification_timeout_secs,
            self.engine_config.verification_output_cap_bytes,
        )
        .await
    }

    /// `init` -> `in_progress`: creates and persists a fresh Session, or
    /// returns the existing one unchanged (session conflict is the
    /// caller's responsibility to check via `session_status` first).
    pub async fn session_init(&self, task: &str, existing_features: Vec<Feature>) -> Result<Session> {
        if self.storage.load().await.is_some() {
            bail!("a session already exists for this project");
        }
        loom_core::paths::validate_project_dir(&self.project_dir)?;
        let mut session = Session::new(self.project_dir.clone(), task);
        session.features = existing_features;
        session.log("session initialised");
        self.registry.load().await?;
        self.proposals.load().await?;
        self.storage.save(&session).await?;
        self.event_bus.publish(EngineEvent::new("session.initialised", json!({"task": task})));
        Ok(session)
    }

    pub async fn session_status(&self) -> Option<Session> {
        self.storage.load().await
    }

    pub async fn session_pause(&self) -> Result<Session> {
        let mut session = self.require_session().await?;
        if session.status != SessionStatus::InProgress {
            bail!("session is not in_progress; cannot pause");
        }
        for feature in session.features.iter_mut() {
            if feature.status == FeatureStatus::InProgress {
                feature.status = FeatureStatus::Pending;
                feature.worker_id = None;
            }
        }
        let killed = self.workers.kill_all_workers().await;
        session.status = SessionStatus::Paused;
        session.log(format!("session paused, killed {} worker(s)", killed.len()));
        self.storage.save(&session).await?;
        Ok(session)
    }

    pub async fn session_resume(&self) -> Result<Session> {
        let mut session = self.require_session().await?;
        if session.status != SessionStatus::Paused {
            bail!("session is not paused; cannot resume");
        }
        session.status = SessionStatus::InProgress;
        session.log("session resumed");
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// Kills all workers, clears the persisted state, requires explicit
    /// confirmation to avoid accidental data loss.
    pub async fn session_reset(&self, confirm: bool) -> Result<()> {
        if !confirm {
            bail!("session_reset requires confirm=true");
        }
        self.workers.kill_all_workers().await;
        self.storage.clear().await?;
        self.event_bus.publish(EngineEvent::new("session.reset", json!({})));
        Ok(())
    }

    pub async fn session_stats(&self) -> Result<serde_json::Value> {
        let session = self.require_session().await?;
        let total = session.features.len();
        let completed = session.features.iter().filter(|f| f.status == FeatureStatus::Completed).count();
        let failed = session.features.iter().filter(|f| f.status == FeatureStatus::Failed).count();
        let in_progress = session.features.iter().filter(|f| f.status == FeatureStatus::InProgress).count();
        Ok(json!({
            "status": session.status,
            "totalFeatures": total,
            "completed": completed,
            "failed": failed,
            "inProgress": in_progress,
            "pending": total - completed - failed - in_progress,
        }))
    }

    pub async fn progress_log(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let session = self.require_session().await?;
        match limit {
            Some(n) => Ok(session.progress_log.iter().rev().take(n).rev().cloned().collect()),
            None => Ok(session.progress_log),
        }
    }

    pub async fn feature_add(&self, feature: Feature) -> Result<Session> {
        let mut session = self.require_session().await?;
        if session.features.iter().any(|f| f.id == feature.id) {
            bail!("feature {} already exists", feature.id);
        }
        session.log(format!("feature added: {}", feature.id));
        session.features.push(feature);
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// Fails with no state change (P3) if the proposed dependencies would
    /// create a cycle in the feature graph (I2).
    pub async fn feature_set_dependencies(&self, feature_id: &str, depends_on: Vec<String>) -> Result<Session> {
        let mut session = self.require_session().await?;
        if !session.features.iter().any(|f| f.id == feature_id) {
            bail!("unknown feature: {feature_id}");
        }
        if scheduler::would_create_cycle(&session.features, feature_id, &depends_on) {
            bail!("setting dependencies for {feature_id} would create a dependency cycle");
        }
        let feature = session.features.iter_mut().find(|f| f.id == feature_id).unwrap();
        feature.depends_on = depends_on;
        self.storage.save(&session).await?;
        Ok(session)
    }

    pub async fn feature_set_context(&self, feature_id: &str, context: serde_json::Value) -> Result<Session> {
        let mut session = self.require_session().await?;
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        feature.context = Some(context);
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// Advisory routing annotation only (§9: `routing` is never read by any
    /// component logic, purely pass-through).
    pub async fn feature_route(&self, feature_id: &str, routing: serde_json::Value) -> Result<Session> {
        let mut session = self.require_session().await?;
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        feature.routing = Some(routing);
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// Stores enriched context (the fixed data shape documentation
    /// discovery hands back; §1 places the discovery itself out of scope).
    pub async fn feature_enrich(&self, feature_id: &str, enrichment: serde_json::Value) -> Result<Session> {
        self.feature_set_context(feature_id, enrichment).await
    }

    pub async fn feature_graph(&self) -> Result<scheduler::FeatureGraph> {
        let session = self.require_session().await?;
        Ok(scheduler::feature_graph(&session.features))
    }

    pub async fn feature_retry(&self, feature_id: &str, reset_attempts: bool) -> Result<Session> {
        let mut session = self.require_session().await?;
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        feature.status = FeatureStatus::Pending;
        feature.worker_id = None;
        feature.last_error = None;
        if reset_attempts {
            feature.attempts = 0;
        }
        session.log(format!("feature retried: {feature_id}"));
        self.storage.save(&session).await?;
        Ok(session)
    }

    pub async fn feature_mark_complete(
        &self,
        feature_id: &str,
        success: bool,
        notes: Option<String>,
        max_retries: u32,
    ) -> Result<Session> {
        let mut session = self.require_session().await?;
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        feature.worker_outcome = None;
        if success {
            feature.status = FeatureStatus::Completed;
            feature.completed_at = Some(chrono::Utc::now());
        } else if feature.attempts >= max_retries {
            feature.status = FeatureStatus::Failed;
            feature.last_error = notes.clone();
        } else {
            feature.status = FeatureStatus::Pending;
            feature.worker_id = None;
            feature.last_error = notes.clone();
        }
        session.log(format!(
            "feature {feature_id} marked {}",
            if success { "completed" } else { "not complete" }
        ));
        self.storage.save(&session).await?;
        self.maybe_transition_to_review_or_completion(&mut session).await?;
        Ok(session)
    }

    /// `planning_competitive_start`: spawns differentiated planner A/B
    /// workers for `feature_id` when it is above the complexity threshold
    /// (or `forced`). Returns the two session names the caller must pass
    /// back into `planning_evaluate` once both plan files exist.
    pub async fn planning_competitive_start(&self, feature_id: &str, forced: bool) -> Result<(String, String)> {
        let mut session = self.require_session().await?;
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        if !crate::competitive::should_plan_competitively(feature, forced) {
            bail!("feature {feature_id} is below the competitive-planning complexity threshold");
        }
        let (session_a, session_b) =
            crate::competitive::start_competitive_planning(&self.project_dir, feature, &self.workers, &self.launcher).await?;
        session.log(format!("competitive planning started for {feature_id}"));
        self.storage.save(&session).await?;
        Ok((session_a, session_b))
    }

    /// `planning_evaluate`: once both planner session names' plan files
    /// exist, scores them and records the winner on the feature.
    pub async fn planning_evaluate(&self, feature_id: &str, session_a: &str, session_b: &str) -> Result<Session> {
        let mut session = self.require_session().await?;
        let paths = self.storage.paths();
        let Some((plan_a, plan_b)) = crate::competitive::read_competing_plans(&self.workers, paths, session_a, session_b).await else {
            bail!("both planner outputs are not yet available for {feature_id}");
        };
        let feature = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        crate::competitive::evaluate_plans(feature, plan_a, plan_b)?;
        self.workers.kill_worker(session_a).await.ok();
        self.workers.kill_worker(session_b).await.ok();
        session.log(format!("competitive plans evaluated for {feature_id}"));
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// `voting_start(count∈[2,3])`: clones `feature_id` into `count` redundant
    /// voter features, each dispatched to its own implementor worker.
    pub async fn voting_start(&self, feature_id: &str, count: u8) -> Result<Session> {
        if !(2..=3).contains(&count) {
            bail!("voting count must be in [2,3], got {count}");
        }
        let mut session = self.require_session().await?;
        let original = session
            .features
            .iter()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?
            .clone();
        let mut voters = Vec::new();
        for k in 1..=count {
            let mut voter = Feature::new(format!("{feature_id}-voter-{k}"), original.description.clone());
            voter.voting_group = Some(feature_id.to_string());
            voter.voting_role = Some(format!("voter-{k}"));
            let session_name = self
                .workers
                .start_voting_worker(&self.project_dir, &voter, k, None, &self.launcher)
                .await?;
            voter.worker_id = Some(session_name);
            voter.status = FeatureStatus::InProgress;
            voter.started_at = Some(chrono::Utc::now());
            voters.push(voter);
        }
        session.log(format!("voting started for {feature_id} with {count} voter(s)"));
        session.features.extend(voters);
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// `voting_evaluate`: scores every terminal voter of `feature_id`,
    /// marks the original feature `completed` (winner scored > 50) or
    /// `failed`, and kills the non-winning voter workers.
    pub async fn voting_evaluate(&self, feature_id: &str) -> Result<Session> {
        let mut session = self.require_session().await?;
        let paths = self.storage.paths();
        let voter_ids: Vec<String> = session
            .features
            .iter()
            .filter(|f| f.voting_group.as_deref() == Some(feature_id))
            .map(|f| f.id.clone())
            .collect();
        if voter_ids.is_empty() {
            bail!("no voting group found for {feature_id}");
        }

        let mut scores = Vec::new();
        let mut by_voter: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for voter_id in &voter_ids {
            let session_name = session
                .features
                .iter()
                .find(|f| &f.id == voter_id)
                .and_then(|f| f.worker_id.clone())
                .ok_or_else(|| anyhow::anyhow!("voter {voter_id} has no worker"))?;
            let done = self.workers.read_done_file(paths, &session_name).await;
            let check = self.workers.check_worker(&session_name, 200).await.ok();
            let log_tail = check.map(|c| c.output).unwrap_or_default();
            let score = crate::competitive::score_vote(done.as_deref(), &log_tail, None);
            by_voter.insert(voter_id.clone(), score);
            scores.push(crate::competitive::VoteScore {
                session_name: session_name.clone(),
                score,
            });
        }
        let winner_session = crate::competitive::select_winner(&scores)
            .map(|v| v.session_name.clone())
            .ok_or_else(|| anyhow::anyhow!("no votes to evaluate for {feature_id}"))?;
        let winner_score = scores.iter().find(|v| v.session_name == winner_session).map(|v| v.score).unwrap_or(0.0);

        for voter_id in &voter_ids {
            let feature = session.features.iter_mut().find(|f| &f.id == voter_id).unwrap();
            let is_winner = feature.worker_id.as_deref() == Some(winner_session.as_str());
            feature.voting_winner = Some(is_winner);
            feature.voting_score = by_voter.get(voter_id).copied();
            feature.status = if is_winner { FeatureStatus::Completed } else { FeatureStatus::Failed };
            if !is_winner {
                if let Some(session_name) = feature.worker_id.clone() {
                    self.workers.kill_worker(&session_name).await.ok();
                }
            }
        }

        let original = session
            .features
            .iter_mut()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| anyhow::anyhow!("unknown feature: {feature_id}"))?;
        if winner_score > 50.0 {
            original.status = FeatureStatus::Completed;
            original.completed_at = Some(chrono::Utc::now());
        } else {
            original.status = FeatureStatus::Failed;
            original.last_error = Some(format!("no voter scored above the acceptance threshold (best: {winner_score})"));
        }
        session.log(format!("voting evaluated for {feature_id}, winner scored {winner_score}"));
        self.storage.save(&session).await?;
        self.maybe_transition_to_review_or_completion(&mut session).await?;
        Ok(session)
    }

    /// `worker_check`: status plus the tail of a worker's captured output.
    pub async fn worker_check(&self, session_name: &str, lines: usize) -> Result<loom_runtime::WorkerCheck> {
        self.workers.check_worker(session_name, lines).await
    }

    pub async fn worker_send_message(&self, session_name: &str, text: &str) -> Result<()> {
        self.workers.send_message(session_name, text).await
    }

    pub async fn workers_check_all(&self) -> Vec<(String, loom_types::WorkerStatus)> {
        self.workers.check_all_workers().await
    }

    /// `workers_start_parallel(ids[], customPrompts?)`: starts an
    /// implementor worker per id **concurrently** (spec.md §6); partial
    /// failures leave the corresponding feature pending and unchanged
    /// otherwise.
    pub async fn workers_start_parallel(&self, ids: &[String], custom_prompts: Option<&[Option<String>]>) -> Result<Vec<String>> {
        let mut session = self.require_session().await?;
        let all_features_snapshot = session.features.clone();

        let mut clones = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let custom_prompt = custom_prompts.and_then(|p| p.get(i)).and_then(|p| p.clone());
            match session.features.iter().find(|f| &f.id == id) {
                Some(feature) => clones.push((feature.clone(), custom_prompt)),
                None => warn!(feature_id = %id, "workers_start_parallel: unknown feature, skipping"),
            }
        }

        let futures = clones.into_iter().map(|(mut feature, custom_prompt)| {
            let all_features_snapshot = &all_features_snapshot;
            async move {
                let result = self
                    .workers
                    .start_worker(&self.project_dir, &mut feature, all_features_snapshot, custom_prompt.as_deref(), None, &self.launcher)
                    .await;
                (feature, result)
            }
        });
        let results = join_all(futures).await;

        let mut started = Vec::new();
        for (feature, result) in results {
            match result {
                Ok(session_name) => {
                    if let Some(slot) = session.features.iter_mut().find(|f| f.id == feature.id) {
                        *slot = feature;
                    }
                    started.push(session_name);
                }
                Err(err) => warn!(feature_id = %feature.id, error = %err, "workers_start_parallel: failed to start"),
            }
        }
        session.log(format!("started {} worker(s) in parallel", started.len()));
        self.storage.save(&session).await?;
        Ok(started)
    }

    /// `workers_validate(ids[])`: runs `protocol_validate_feature` for every
    /// id without dispatching anything, for a caller that wants to check
    /// before committing to a batch.
    pub async fn workers_validate(&self, ids: &[String]) -> Result<Vec<(String, FeatureValidationReport)>> {
        let mut out = Vec::new();
        for id in ids {
            out.push((id.clone(), self.protocol_validate_feature(id, None, None).await?));
        }
        Ok(out)
    }

    /// Dispatches the top-priority batch of ready features **concurrently**
    /// (spec.md §4.4: "calls `startWorker` per selected feature
    /// concurrently"); partial failures leave their features pending,
    /// attempts unchanged.
    pub async fn dispatch_ready_batch(&self, batch_size: usize, strategy: Strategy) -> Result<Vec<String>> {
        let mut session = self.require_session().await?;
        let protocols = self.registry.list().await;
        let selected_ids: Vec<String> = scheduler::select_batch(&session.features, &protocols, strategy, batch_size)
            .into_iter()
            .map(|f| f.id.clone())
            .collect();

        let conflicts = scheduler::analyze_conflicts(&session.features);
        for conflict in &conflicts {
            warn!(a = %conflict.a, b = %conflict.b, reason = %conflict.reason, "advisory feature conflict");
        }

        let all_features_snapshot = session.features.clone();
        let clones: Vec<Feature> = selected_ids
            .iter()
            .filter_map(|id| session.features.iter().find(|f| &f.id == id).cloned())
            .collect();

        let futures = clones.into_iter().map(|mut feature| {
            let all_features_snapshot = &all_features_snapshot;
            async move {
                let result = self
                    .workers
                    .start_worker(&self.project_dir, &mut feature, all_features_snapshot, None, None, &self.launcher)
                    .await;
                (feature, result)
            }
        });
        let results = join_all(futures).await;

        let mut started = Vec::new();
        for (feature, result) in results {
            match result {
                Ok(session_name) => {
                    if let Some(slot) = session.features.iter_mut().find(|f| f.id == feature.id) {
                        *slot = feature;
                    }
                    started.push(session_name);
                }
                Err(err) => warn!(feature_id = %feature.id, error = %err, "failed to start worker for ready feature"),
            }
        }
        session.log(format!("dispatched batch of {} worker(s)", started.len()));
        self.storage.save(&session).await?;
        Ok(started)
    }

    /// Polls the completion monitor once and records any terminal
    /// transitions it reports, idempotently. A worker reaching `completed`/
    /// `crashed` does NOT auto-advance the feature (spec.md §4.3, §4.9
    /// scenario 1): it stays `in_progress` with `workerOutcome` set, and the
    /// caller must inspect the result and call `feature_mark_complete`.
    pub async fn poll_completions(&self) -> Result<Vec<String>> {
        let events = self.workers.poll_completions(self.storage.paths()).await;
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut session = self.require_session().await?;
        let mut touched = Vec::new();
        for event in events {
            if let Some(feature) = session.features.iter_mut().find(|f| f.id == event.feature_id) {
                feature.worker_outcome = Some(event.status);
                if event.status == loom_types::WorkerStatus::Crashed {
                    feature.last_error = Some("worker crashed".to_string());
                }
                touched.push(event.feature_id.clone());
            }
        }
        self.storage.save(&session).await?;
        Ok(touched)
    }

    /// `in_progress` -> `reviewing`/`completed`/`completed_with_failures`
    /// once every feature is terminal.
    async fn maybe_transition_to_review_or_completion(&self, session: &mut Session) -> Result<()> {
        if session.status != SessionStatus::InProgress {
            return Ok(());
        }
        if session.features.is_empty() || !session.features.iter().all(|f| f.is_terminal()) {
            return Ok(());
        }
        let all_succeeded = session.features.iter().all(|f| f.status == FeatureStatus::Completed);
        let review_enabled = session.review_config.as_ref().map(|c| c.code_review || c.arch_review).unwrap_or(false);

        if review_enabled {
            session.status = SessionStatus::Reviewing;
            session.log("all features terminal, entering review");
        } else if all_succeeded {
            session.status = SessionStatus::Completed;
            session.completed_at = Some(chrono::Utc::now());
            session.log("session completed");
        } else {
            session.status = SessionStatus::CompletedWithFailures;
            session.completed_at = Some(chrono::Utc::now());
            session.log("session completed with failures");
        }
        self.storage.save(session).await?;
        info!(status = ?session.status, "session transitioned");
        Ok(())
    }

    /// `protocol_validate_feature` (§6): runs the pre-execution pipeline for
    /// `feature_id`, materialises every finding as a `Violation` record
    /// (§4.5, "every violation, regardless of `allowed`, is recorded") and
    /// persists them through the Registry.
    pub async fn protocol_validate_feature(&self, feature_id: &str, tool: Option<String>, file_path: Option<String>) -> Result<FeatureValidationReport> {
        let session = self.require_session().await?;
        if !session.features.iter().any(|f| f.id == feature_id) {
            bail!("unknown feature: {feature_id}");
        }
        let protocols = self.registry.list().await;
        let ctx = EvalContext {
            feature_id: Some(feature_id.to_string()),
            project_path: Some(self.project_dir.to_string_lossy().to_string()),
            tool,
            file_path,
            now: chrono::Utc::now(),
            ..Default::default()
        };
        let report = run_feature_validation(&protocols, &ctx);
        for violation in &report.violations {
            self.registry.record_violation(violation.clone()).await;
        }
        Ok(report)
    }

    pub async fn violation_get(&self, violation_id: Option<&str>) -> Vec<loom_types::Violation> {
        let all = self.registry.violations().await;
        match violation_id {
            Some(id) => all.into_iter().filter(|v| v.id == id).collect(),
            None => all,
        }
    }

    pub async fn violation_resolve(&self, violation_id: &str, resolution: Option<String>) -> Result<()> {
        self.registry.resolve_violation(violation_id, resolution).await
    }

    pub async fn audit_get(&self, limit: Option<usize>) -> Vec<loom_types::AuditEntry> {
        let log = self.registry.audit_log().await;
        match limit {
            Some(n) => log.into_iter().rev().take(n).rev().collect(),
            None => log,
        }
    }

    pub fn base_constraints_get(&self) -> &BaseConstraints {
        self.proposals.base_constraints()
    }

    pub async fn proposal_review(&self, proposal_id: &str) -> Result<loom_types::Proposal> {
        self.proposals.review(proposal_id).await
    }

    /// `protocols_export`: bundles the current registry (or a subset of
    /// `ids`) for hand-off to another instance.
    pub async fn protocols_export(&self, ids: Option<Vec<String>>) -> Result<loom_governance::Bundle> {
        loom_governance::export_bundle(&self.registry, self.registry_paths(), ids.as_deref()).await
    }

    /// `protocols_import`: reads a previously-exported bundle by id and
    /// registers it into the local registry, resolving conflicts the same
    /// way the sync transport does.
    pub async fn protocols_import(&self, bundle_id: &str) -> Result<loom_governance::ImportReport> {
        let bundle = loom_governance::read_bundle(self.registry_paths(), bundle_id).await?;
        loom_governance::import_bundle(&self.registry, &bundle).await
    }

    /// `protocols_discover`: merges the sync transport's live known-instance
    /// map with any manually-registered peers.
    pub async fn protocols_discover(&self) -> Result<Vec<loom_governance::Peer>> {
        let known = self.sync.known_instances().await;
        loom_governance::discover_peers(self.registry_paths(), known).await
    }

    /// `protocols_sync`: drains and applies every unprocessed inbound sync
    /// message, returning the ids of those that changed local state.
    pub async fn protocols_sync(&self) -> Result<Vec<String>> {
        self.sync.process_inbox(&self.registry).await
    }

    fn registry_paths(&self) -> &loom_core::paths::OrchestratorPaths {
        self.storage.paths()
    }

    /// `review_configure` (§6): installs or replaces the session's review
    /// policy. Has no effect on already-running review workers.
    pub async fn review_configure(&self, code_review: bool, arch_review: bool, require_all_features_terminal: bool) -> Result<Session> {
        let mut session = self.require_session().await?;
        session.review_config = Some(ReviewConfig {
            code_review,
            arch_review,
            require_all_features_terminal,
        });
        session.log("review configuration updated");
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// `review_run`: spawns the reviewer(s) named by `reviewConfig` once the
    /// session has entered `reviewing`. Idempotent against a retried call.
    pub async fn review_run(&self) -> Result<Session> {
        let mut session = self.require_session().await?;
        if session.status != SessionStatus::Reviewing {
            bail!("session is not in review");
        }
        let config = session.review_config.clone().unwrap_or_default();
        let existing = session.review_workers.clone().unwrap_or_default();
        let started = review::start_review_workers(
            &self.project_dir,
            &session.task_description,
            &config,
            &existing,
            &self.workers,
            &self.launcher,
        )
        .await?;
        let mut workers = existing;
        workers.extend(started);
        session.log(format!("review run: {} reviewer(s) active", workers.len()));
        session.review_workers = Some(workers);
        self.storage.save(&session).await?;
        Ok(session)
    }

    /// `review_check`: refreshes reviewer status from the Worker Manager
    /// and, once every reviewer is terminal, materialises `aggregatedReview`
    /// and completes the session (I8).
    pub async fn review_check(&self) -> Result<Session> {
        let mut session = self.require_session().await?;
        let Some(review_workers) = session.review_workers.clone() else {
            bail!("review has not been started for this session");
        };
        let snapshot = self.workers.snapshot().await;
        let refreshed: Vec<loom_types::Worker> = review_workers
            .iter()
            .map(|w| snapshot.iter().find(|s| s.session_name == w.session_name).cloned().unwrap_or_else(|| w.clone()))
            .collect();
        session.review_workers = Some(refreshed.clone());

        if session.aggregated_review.is_none() && review::all_terminal(&refreshed) {
            let aggregated = review::aggregate_review(self.storage.paths(), &self.workers, &refreshed).await;
            session.aggregated_review = Some(aggregated);
            session.log("review aggregated");
            let all_succeeded = session.features.iter().all(|f| f.status == FeatureStatus::Completed);
            session.status = if all_succeeded {
                SessionStatus::Completed
            } else {
                SessionStatus::CompletedWithFailures
            };
            session.completed_at = Some(chrono::Utc::now());
            session.log("review complete");
        }
        self.storage.save(&session).await?;
        Ok(session)
    }

    pub async fn review_results(&self) -> Result<Option<serde_json::Value>> {
        let session = self.require_session().await?;
        Ok(session.aggregated_review)
    }

    /// `review_implement_suggestions`: attaches a reviewer's notes to a
    /// feature and re-queues it for another implementor pass.
    pub async fn review_implement_suggestions(&self, feature_id: &str, notes: serde_json::Value) -> Result<Session> {
        let mut session = self.require_session().await?;
        review::apply_review_suggestions(&mut session, feature_id, notes)?;
        session.log(format!("review suggestions applied to {feature_id}"));
        self.storage.save(&session).await?;
        Ok(session)
    }

    async fn require_session(&self) -> Result<Session> {
        self.storage.load().await.ok_or_else(|| anyhow::anyhow!("no session exists for this project"))
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

/// Thread-safe handle serialising all `SessionController` mutations
/// behind one lock, matching the spec's single-actor-per-project model.
#[derive(Clone)]
pub struct SessionHandle(Arc<RwLock<SessionController>>);

impl SessionHandle {
    pub fn new(controller: SessionController) -> Self {
        Self(Arc::new(RwLock::new(controller)))
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, SessionController> {
        self.0.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, SessionController> {
        self.0.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("build a thing", vec![]).await.unwrap();
        let session = controller.session_status().await.unwrap();
        assert_eq!(session.status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn double_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("first", vec![]).await.unwrap();
        assert!(controller.session_init("second", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![]).await.unwrap();
        let paused = controller.session_pause().await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        let resumed = controller.session_resume().await.unwrap();
        assert_eq!(resumed.status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn completing_all_features_without_review_marks_session_completed() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();
        let session = controller.feature_mark_complete("f1", true, None, 3).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn exhausting_retries_marks_feature_failed_and_session_completed_with_failures() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        let mut feature = Feature::new("f1", "do it");
        feature.attempts = 3;
        controller.session_init("task", vec![feature]).await.unwrap();
        let session = controller.feature_mark_complete("f1", false, Some("boom".to_string()), 3).await.unwrap();
        assert_eq!(session.status, SessionStatus::CompletedWithFailures);
    }

    #[tokio::test]
    async fn reset_without_confirm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![]).await.unwrap();
        assert!(controller.session_reset(false).await.is_err());
        controller.session_reset(true).await.unwrap();
        assert!(controller.session_status().await.is_none());
    }

    #[tokio::test]
    async fn feature_set_dependencies_rejects_a_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller
            .session_init("task", vec![Feature::new("a", "a"), Feature::new("b", "b")])
            .await
            .unwrap();
        controller
            .feature_set_dependencies("b", vec!["a".to_string()])
            .await
            .unwrap();
        let err = controller
            .feature_set_dependencies("a", vec!["b".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn feature_context_route_and_enrich_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();

        controller.feature_set_context("f1", json!({"k": "v"})).await.unwrap();
        controller.feature_route("f1", json!({"preferredWorker": "a"})).await.unwrap();
        let session = controller.feature_enrich("f1", json!({"enriched": true})).await.unwrap();

        let feature = session.features.iter().find(|f| f.id == "f1").unwrap();
        assert_eq!(feature.context, Some(json!({"enriched": true})));
        assert_eq!(feature.routing, Some(json!({"preferredWorker": "a"})));
    }

    #[tokio::test]
    async fn feature_graph_reports_direct_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        let mut b = Feature::new("b", "b");
        b.depends_on = vec!["a".to_string()];
        controller.session_init("task", vec![Feature::new("a", "a"), b]).await.unwrap();

        let graph = controller.feature_graph().await.unwrap();
        assert!(graph.acyclic);
        assert_eq!(graph.nodes.len(), 2);
    }

    #[tokio::test]
    async fn planning_competitive_start_rejects_a_low_complexity_feature() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();
        let err = controller.planning_competitive_start("f1", false).await.unwrap_err();
        assert!(err.to_string().contains("complexity threshold"));
    }

    #[tokio::test]
    async fn voting_start_rejects_an_out_of_range_count() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();
        let err = controller.voting_start("f1", 5).await.unwrap_err();
        assert!(err.to_string().contains("voting count"));
    }

    #[tokio::test]
    async fn review_run_requires_the_session_to_be_in_review() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();
        assert!(controller.review_run().await.is_err());
    }

    #[tokio::test]
    async fn review_configure_persists_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![]).await.unwrap();
        let session = controller.review_configure(true, true, false).await.unwrap();
        let config = session.review_config.unwrap();
        assert!(config.code_review);
        assert!(config.arch_review);
        assert!(!config.require_all_features_terminal);
    }

    #[tokio::test]
    async fn protocol_validate_feature_is_allowed_with_no_protocols_registered() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![Feature::new("f1", "do it")]).await.unwrap();
        let report = controller.protocol_validate_feature("f1", None, None).await.unwrap();
        assert!(report.allowed);
        assert!(controller.violation_get(None).await.is_empty());
    }

    #[tokio::test]
    async fn base_constraints_and_audit_log_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(dir.path().to_path_buf());
        controller.session_init("task", vec![]).await.unwrap();
        assert!(controller.audit_get(None).await.is_empty());
        // base_constraints_get never panics on a fresh controller.
        let _ = controller.base_constraints_get();
    }
}
