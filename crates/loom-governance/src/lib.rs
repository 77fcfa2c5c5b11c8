pub mod distribution;
pub mod enforcement;
pub mod evaluator;
pub mod pattern;
pub mod proposal;
pub mod registry;
pub mod resolver;
pub mod sync;

pub use distribution::{discover_peers, export_bundle, import_bundle, read_bundle, register_peer, Bundle, ImportReport, Peer};
pub use enforcement::{
    applicable_protocols, validate_feature, validate_post_execution, validate_pre_execution,
    EnforcementFinding, FeatureValidationReport, SuggestedAction, ValidationOutcome,
};
pub use evaluator::{evaluate, EvalContext, EvalOutcome, FileOp};
pub use pattern::{any_match, matches};
pub use proposal::{BaseConstraints, ProposalManager};
pub use registry::Registry;
pub use resolver::{get_dependents, order_for_registration, resolve_chain};
pub use sync::{resolve_conflict, ConflictResolution, ConflictWinner, InstanceRecord, SyncManager};
