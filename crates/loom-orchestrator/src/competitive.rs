use std::path::Path;

use anyhow::{bail, Result};
use loom_core::paths::OrchestratorPaths;
use loom_runtime::WorkerManager;
use loom_types::{CompetingPlans, Feature, FeatureStatus, PlanningPhase};
use serde_json::Value;

/// Threshold above which a feature is competitively planned rather than
/// dispatched to a single implementor directly.
pub const DEFAULT_COMPLEXITY_THRESHOLD: f64 = 0.6;

pub fn should_plan_competitively(feature: &Feature, forced: bool) -> bool {
    forced || feature.complexity.map(|c| c > DEFAULT_COMPLEXITY_THRESHOLD).unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct PlanScore {
    pub completeness: f64,
    pub feasibility: f64,
    pub risk_awareness: f64,
    pub clarity: f64,
    pub efficiency: f64,
}

impl PlanScore {
    pub fn total(&self) -> f64 {
        self.completeness + self.feasibility + self.risk_awareness + self.clarity + self.efficiency
    }
}

/// Scores a plan along the five weighted dimensions (20 points each). Each
/// dimension is derived from cheap structural signals in the plan document
/// rather than re-invoking a model: a richer `summary`/`steps`/`risks`
/// document scores higher on the corresponding axis.
pub fn score_plan(plan: &Value) -> PlanScore {
    let summary_len = plan.get("summary").and_then(|v| v.as_str()).map(|s| s.len()).unwrap_or(0);
    let steps_len = plan.get("steps").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
    let risks_len = plan.get("risks").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
    let has_files = plan.get("filesToChange").and_then(|v| v.as_array()).map(|a| !a.is_empty()).unwrap_or(false);

    PlanScore {
        completeness: scale(summary_len as f64, 400.0),
        feasibility: if has_files { 20.0 } else { 8.0 },
        risk_awareness: scale(risks_len as f64 * 50.0, 200.0),
        clarity: scale(steps_len as f64 * 40.0, 200.0),
        efficiency: if steps_len > 0 && steps_len <= 8 { 20.0 } else { 12.0 },
    }
}

fn scale(value: f64, max_input: f64) -> f64 {
    (value / max_input * 20.0).clamp(0.0, 20.0)
}

/// Scores plan A and B, selects the higher total (ties broken by higher
/// `riskAwareness`), and records the winner with a human-readable reason.
pub fn evaluate_plans(feature: &mut Feature, plan_a: Value, plan_b: Value) -> Result<()> {
    let score_a = score_plan(&plan_a);
    let score_b = score_plan(&plan_b);
    let (winner, reason) = if score_a.total() > score_b.total() {
        ("A", dominant_reason("completeness", &score_a, &score_b))
    } else if score_b.total() > score_a.total() {
        ("B", dominant_reason("completeness", &score_b, &score_a))
    } else if score_a.risk_awareness >= score_b.risk_awareness {
        ("A", "tied total score; A wins on riskAwareness".to_string())
    } else {
        ("B", "tied total score; B wins on riskAwareness".to_string())
    };

    feature.competing_plans = Some(CompetingPlans {
        plan_a: Some(plan_a),
        plan_b: Some(plan_b),
        winner: Some(winner.to_string()),
        selection_reason: Some(reason),
    });
    feature.planning_phase = Some(PlanningPhase::Evaluating);
    Ok(())
}

fn dominant_reason(_axis: &str, winner: &PlanScore, loser: &PlanScore) -> String {
    let dims = [
        ("completeness", winner.completeness - loser.completeness),
        ("feasibility", winner.feasibility - loser.feasibility),
        ("riskAwareness", winner.risk_awareness - loser.risk_awareness),
        ("clarity", winner.clarity - loser.clarity),
        ("efficiency", winner.efficiency - loser.efficiency),
    ];
    let (axis, _) = dims
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .copied()
        .unwrap_or(("completeness", 0.0));
    format!("higher total score, largest margin on {axis}")
}

/// Reads both planner output files; returns `None` until both exist.
pub async fn read_competing_plans(
    workers: &WorkerManager,
    paths: &OrchestratorPaths,
    planner_a_key: &str,
    planner_b_key: &str,
) -> Option<(Value, Value)> {
    let a = workers.read_plan_file(paths, planner_a_key).await?;
    let b = workers.read_plan_file(paths, planner_b_key).await?;
    Some((a, b))
}

pub async fn start_competitive_planning(
    project_dir: &Path,
    feature: &mut Feature,
    workers: &WorkerManager,
    launcher: &dyn loom_runtime::WorkerLauncher,
) -> Result<(String, String)> {
    if feature.status != FeatureStatus::Pending {
        bail!("feature {} is not pending; cannot start competitive planning", feature.id);
    }
    let session_a = workers
        .start_planner_worker(project_dir, feature, true, None, launcher)
        .await?;
    let session_b = workers
        .start_planner_worker(project_dir, feature, false, None, launcher)
        .await?;
    feature.planning_phase = Some(PlanningPhase::Planning);
    Ok((session_a, session_b))
}

#[derive(Debug, Clone)]
pub struct VoteScore {
    pub session_name: String,
    pub score: f64,
}

/// `+40` tests-pass evidence, `+20` detailed done file, `+20`/`+10` for
/// change size under 100/200 lines, `+10`/`+5` for absence of / few errors
/// in the log.
pub fn score_vote(done_file: Option<&str>, log_tail: &str, changed_lines: Option<usize>) -> f64 {
    let mut score = 0.0;
    if let Some(done) = done_file {
        if done.to_lowercase().contains("tests pass") || done.to_lowercase().contains("all tests passing") {
            score += 40.0;
        }
        if done.len() > 200 {
            score += 20.0;
        }
    }
    if let Some(lines) = changed_lines {
        if lines < 100 {
            score += 20.0;
        } else if lines < 200 {
            score += 10.0;
        }
    }
    let error_count = log_tail.to_lowercase().matches("error").count();
    if error_count == 0 {
        score += 10.0;
    } else if error_count <= 3 {
        score += 5.0;
    }
    score
}

/// Highest score wins; ties broken by first in role order (vec order).
pub fn select_winner(scores: &[VoteScore]) -> Option<&VoteScore> {
    scores.iter().fold(None, |best, current| match best {
        None => Some(current),
        Some(b) if current.score > b.score => Some(current),
        Some(b) => Some(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn richer_plan_wins_with_completeness_reason() {
        let mut feature = Feature::new("f1", "do a thing");
        let plan_a = json!({"summary": "x".repeat(320), "steps": ["a", "b"], "filesToChange": ["a.rs"]});
        let plan_b = json!({"summary": "y".repeat(110), "steps": ["a"], "filesToChange": ["b.rs"]});
        evaluate_plans(&mut feature, plan_a, plan_b).unwrap();
        let plans = feature.competing_plans.unwrap();
        assert_eq!(plans.winner.as_deref(), Some("A"));
    }

    #[test]
    fn vote_scoring_rewards_tests_pass_and_small_diff() {
        let winner = score_vote(Some("all tests passing, clean run"), "", Some(50));
        let other = score_vote(None, "error\nerror\nerror\nerror", Some(500));
        assert!(winner > other);
    }

    #[test]
    fn select_winner_picks_highest_score_first_on_tie() {
        let scores = vec![
            VoteScore { session_name: "voter-1".to_string(), score: 60.0 },
            VoteScore { session_name: "voter-2".to_string(), score: 60.0 },
        ];
        let winner = select_winner(&scores).unwrap();
        assert_eq!(winner.session_name, "voter-1");
    }
}
