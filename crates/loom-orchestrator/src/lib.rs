pub mod competitive;
pub mod review;
pub mod scheduler;
pub mod session;

pub use competitive::{
    evaluate_plans, read_competing_plans, score_plan, score_vote, select_winner,
    should_plan_competitively, start_competitive_planning, PlanScore, VoteScore,
};
pub use review::{aggregate_review, all_terminal, apply_review_suggestions, start_review_workers};
pub use scheduler::{
    analyze_conflicts, dependency_map, feature_graph, is_ready, priority, ready_features, select_batch,
    would_create_cycle, FeatureGraph, FeatureGraphNode, Strategy,
};
pub use session::{SessionController, SessionHandle};
