use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use loom_orchestrator::{SessionController, Strategy};
use loom_types::{Feature, Protocol, ProposalSource};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "loom-engine")]
#[command(about = "Headless long-running multi-agent orchestration engine")]
struct Cli {
    #[arg(long, env = "LOOM_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the read-only dashboard over an existing session.
    Serve {
        #[arg(long, env = "DASHBOARD_PORT", default_value_t = 3456)]
        port: u16,
    },
    SessionInit {
        task: String,
    },
    SessionStatus,
    SessionPause,
    SessionResume,
    SessionReset {
        #[arg(long)]
        confirm: bool,
    },
    SessionStats,
    ProgressLog {
        #[arg(long)]
        limit: Option<usize>,
    },
    FeatureAdd {
        id: String,
        description: String,
    },
    FeatureSetDependencies {
        feature_id: String,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    FeatureRetry {
        feature_id: String,
        #[arg(long)]
        reset_attempts: bool,
    },
    FeatureMarkComplete {
        feature_id: String,
        #[arg(long)]
        success: bool,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Dispatch the next ready batch of features to workers.
    WorkersDispatch {
        #[arg(long, default_value_t = 3)]
        batch_size: usize,
        #[arg(long, value_enum, default_value = "breadth-first")]
        strategy: StrategyArg,
    },
    WorkersCheckAll,
    WorkerCheck {
        session_name: String,
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    WorkerSendMessage {
        session_name: String,
        text: String,
    },
    WorkersStartParallel {
        #[arg(value_delimiter = ',')]
        ids: Vec<String>,
    },
    WorkersValidate {
        #[arg(value_delimiter = ',')]
        ids: Vec<String>,
    },
    /// Run a verification command through the allow-list primitive
    /// (`cargo test`, `npm test`, `pytest`, ...); rejects anything else and
    /// any argument carrying a shell metacharacter.
    VerificationRun {
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },
    FeatureSetContext {
        feature_id: String,
        context_file: PathBuf,
    },
    FeatureRoute {
        feature_id: String,
        routing_file: PathBuf,
    },
    FeatureEnrich {
        feature_id: String,
        enrichment_file: PathBuf,
    },
    FeatureGraph,
    PlanningCompetitiveStart {
        feature_id: String,
        #[arg(long)]
        forced: bool,
    },
    PlanningEvaluate {
        feature_id: String,
        session_a: String,
        session_b: String,
    },
    VotingStart {
        feature_id: String,
        #[arg(long, default_value_t = 3)]
        count: u8,
    },
    VotingEvaluate {
        feature_id: String,
    },
    ProtocolValidateFeature {
        feature_id: String,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long)]
        file_path: Option<String>,
    },
    ViolationGet {
        #[arg(long)]
        violation_id: Option<String>,
    },
    ViolationResolve {
        violation_id: String,
        #[arg(long)]
        resolution: Option<String>,
    },
    AuditGet {
        #[arg(long)]
        limit: Option<usize>,
    },
    ProtocolsExport {
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<String>>,
    },
    ProtocolsImport {
        bundle_id: String,
    },
    ProtocolsDiscover,
    ProtocolsSync,
    ProposalReview {
        proposal_id: String,
    },
    BaseConstraintsGet,
    ReviewConfigure {
        #[arg(long)]
        code_review: bool,
        #[arg(long)]
        arch_review: bool,
        #[arg(long)]
        require_all_features_terminal: bool,
    },
    ReviewRun,
    ReviewCheck,
    ReviewResults,
    ReviewImplementSuggestions {
        feature_id: String,
        notes_file: PathBuf,
    },
    ProtocolRegister {
        /// Path to a JSON file holding the Protocol document.
        protocol_file: PathBuf,
    },
    ProtocolActivate {
        protocol_id: String,
    },
    ProtocolDeactivate {
        protocol_id: String,
    },
    ProtocolList,
    ProposalSubmit {
        protocol_file: PathBuf,
        #[arg(long, value_enum, default_value = "user")]
        source: ProposalSourceArg,
        #[arg(long)]
        description: Option<String>,
    },
    ProposalApprove {
        proposal_id: String,
    },
    ProposalReject {
        proposal_id: String,
        #[arg(long, default_value = "rejected via CLI")]
        reason: String,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum StrategyArg {
    BreadthFirst,
    DepthFirst,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::BreadthFirst => Strategy::BreadthFirst,
            StrategyArg::DepthFirst => Strategy::DepthFirst,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ProposalSourceArg {
    Llm,
    User,
    System,
    Import,
}

impl From<ProposalSourceArg> for ProposalSource {
    fn from(value: ProposalSourceArg) -> Self {
        match value {
            ProposalSourceArg::Llm => ProposalSource::Llm,
            ProposalSourceArg::User => ProposalSource::User,
            ProposalSourceArg::System => ProposalSource::System,
            ProposalSourceArg::Import => ProposalSource::Import,
        }
    }
}

/// Exit codes per the external interface contract: 0 success, 2 invalid
/// args, 3 session missing, 4 session conflict, 5 constraint violation
/// blocked, 1 otherwise.
const EXIT_OK: u8 = 0;
const EXIT_SESSION_MISSING: u8 = 3;
const EXIT_SESSION_CONFLICT: u8 = 4;
const EXIT_CONSTRAINT_BLOCKED: u8 = 5;
const EXIT_OTHER: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_OTHER)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let controller = Arc::new(SessionController::new(&cli.project_dir));

    match cli.command {
        Command::Serve { port } => {
            let addr = loom_server::dashboard_addr(port);
            let enabled = std::env::var("ENABLE_DASHBOARD").map(|v| v != "false").unwrap_or(true);
            if !enabled {
                info!("dashboard disabled via ENABLE_DASHBOARD=false");
                return Ok(EXIT_OK);
            }
            let state = loom_server::AppState::new(controller);
            loom_server::serve(addr, state).await?;
            Ok(EXIT_OK)
        }
        Command::SessionInit { task } => {
            if controller.session_status().await.is_some() {
                eprintln!("a session already exists for {}", cli.project_dir.display());
                return Ok(EXIT_SESSION_CONFLICT);
            }
            let session = controller.session_init(&task, Vec::new()).await?;
            print_json(&session)
        }
        Command::SessionStatus => with_session(&controller, |session| print_json(&session)).await,
        Command::SessionPause => {
            let session = controller.session_pause().await?;
            print_json(&session)
        }
        Command::SessionResume => {
            let session = controller.session_resume().await?;
            print_json(&session)
        }
        Command::SessionReset { confirm } => {
            controller.session_reset(confirm).await?;
            println!("session reset");
            Ok(EXIT_OK)
        }
        Command::SessionStats => {
            let stats = controller.session_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(EXIT_OK)
        }
        Command::ProgressLog { limit } => {
            let lines = controller.progress_log(limit).await?;
            for line in lines {
                println!("{line}");
            }
            Ok(EXIT_OK)
        }
        Command::FeatureAdd { id, description } => {
            let session = controller.feature_add(Feature::new(id, description)).await?;
            print_json(&session)
        }
        Command::FeatureSetDependencies { feature_id, depends_on } => {
            let session = controller.feature_set_dependencies(&feature_id, depends_on).await?;
            print_json(&session)
        }
        Command::FeatureRetry { feature_id, reset_attempts } => {
            let session = controller.feature_retry(&feature_id, reset_attempts).await?;
            print_json(&session)
        }
        Command::FeatureMarkComplete { feature_id, success, notes, max_retries } => {
            let session = controller
                .feature_mark_complete(&feature_id, success, notes, max_retries)
                .await?;
            print_json(&session)
        }
        Command::WorkersDispatch { batch_size, strategy } => {
            let started = controller.dispatch_ready_batch(batch_size, strategy.into()).await?;
            print_json(&started)
        }
        Command::WorkersCheckAll => {
            let completed = controller.poll_completions().await?;
            print_json(&completed)
        }
        Command::WorkerCheck { session_name, lines } => {
            let check = controller.worker_check(&session_name, lines).await?;
            print_json(&check)
        }
        Command::WorkerSendMessage { session_name, text } => {
            controller.worker_send_message(&session_name, &text).await?;
            println!("message sent to {session_name}");
            Ok(EXIT_OK)
        }
        Command::WorkersStartParallel { ids } => {
            let started = controller.workers_start_parallel(&ids, None).await?;
            print_json(&started)
        }
        Command::WorkersValidate { ids } => {
            let reports = controller.workers_validate(&ids).await?;
            print_json(&reports)
        }
        Command::VerificationRun { argv } => {
            let outcome = controller.verification_run(argv).await?;
            print_json(&outcome)
        }
        Command::FeatureSetContext { feature_id, context_file } => {
            let raw = tokio::fs::read_to_string(&context_file).await?;
            let context: serde_json::Value = serde_json::from_str(&raw)?;
            let session = controller.feature_set_context(&feature_id, context).await?;
            print_json(&session)
        }
        Command::FeatureRoute { feature_id, routing_file } => {
            let raw = tokio::fs::read_to_string(&routing_file).await?;
            let routing: serde_json::Value = serde_json::from_str(&raw)?;
            let session = controller.feature_route(&feature_id, routing).await?;
            print_json(&session)
        }
        Command::FeatureEnrich { feature_id, enrichment_file } => {
            let raw = tokio::fs::read_to_string(&enrichment_file).await?;
            let enrichment: serde_json::Value = serde_json::from_str(&raw)?;
            let session = controller.feature_enrich(&feature_id, enrichment).await?;
            print_json(&session)
        }
        Command::FeatureGraph => {
            let graph = controller.feature_graph().await?;
            print_json(&graph)
        }
        Command::PlanningCompetitiveStart { feature_id, forced } => {
            let (session_a, session_b) = controller.planning_competitive_start(&feature_id, forced).await?;
            print_json(&serde_json::json!({"sessionA": session_a, "sessionB": session_b}))
        }
        Command::PlanningEvaluate { feature_id, session_a, session_b } => {
            let session = controller.planning_evaluate(&feature_id, &session_a, &session_b).await?;
            print_json(&session)
        }
        Command::VotingStart { feature_id, count } => {
            let session = controller.voting_start(&feature_id, count).await?;
            print_json(&session)
        }
        Command::VotingEvaluate { feature_id } => {
            let session = controller.voting_evaluate(&feature_id).await?;
            print_json(&session)
        }
        Command::ProtocolValidateFeature { feature_id, tool, file_path } => {
            let report = controller.protocol_validate_feature(&feature_id, tool, file_path).await?;
            if !report.allowed {
                print_json(&report)?;
                return Ok(EXIT_CONSTRAINT_BLOCKED);
            }
            print_json(&report)
        }
        Command::ViolationGet { violation_id } => {
            let violations = controller.violation_get(violation_id.as_deref()).await;
            print_json(&violations)
        }
        Command::ViolationResolve { violation_id, resolution } => {
            controller.violation_resolve(&violation_id, resolution).await?;
            println!("violation {violation_id} resolved");
            Ok(EXIT_OK)
        }
        Command::AuditGet { limit } => {
            let entries = controller.audit_get(limit).await;
            print_json(&entries)
        }
        Command::ProtocolsExport { ids } => {
            let bundle = controller.protocols_export(ids).await?;
            print_json(&bundle)
        }
        Command::ProtocolsImport { bundle_id } => {
            let report = controller.protocols_import(&bundle_id).await?;
            print_json(&report)
        }
        Command::ProtocolsDiscover => {
            let peers = controller.protocols_discover().await?;
            print_json(&peers)
        }
        Command::ProtocolsSync => {
            let changed = controller.protocols_sync().await?;
            print_json(&changed)
        }
        Command::ProposalReview { proposal_id } => {
            let proposal = controller.proposal_review(&proposal_id).await?;
            print_json(&proposal)
        }
        Command::BaseConstraintsGet => print_json(controller.base_constraints_get()),
        Command::ReviewConfigure { code_review, arch_review, require_all_features_terminal } => {
            let session = controller
                .review_configure(code_review, arch_review, require_all_features_terminal)
                .await?;
            print_json(&session)
        }
        Command::ReviewRun => {
            let session = controller.review_run().await?;
            print_json(&session)
        }
        Command::ReviewCheck => {
            let session = controller.review_check().await?;
            print_json(&session)
        }
        Command::ReviewResults => {
            let results = controller.review_results().await?;
            print_json(&results)
        }
        Command::ReviewImplementSuggestions { feature_id, notes_file } => {
            let raw = tokio::fs::read_to_string(&notes_file).await?;
            let notes: serde_json::Value = serde_json::from_str(&raw)?;
            let session = controller.review_implement_suggestions(&feature_id, notes).await?;
            print_json(&session)
        }
        Command::ProtocolRegister { protocol_file } => {
            let raw = tokio::fs::read_to_string(&protocol_file).await?;
            let protocol: Protocol = serde_json::from_str(&raw)?;
            match controller.registry.register(protocol).await {
                Ok(()) => {
                    println!("protocol registered");
                    Ok(EXIT_OK)
                }
                Err(err) => {
                    eprintln!("registration blocked: {err:#}");
                    Ok(EXIT_CONSTRAINT_BLOCKED)
                }
            }
        }
        Command::ProtocolActivate { protocol_id } => {
            controller.registry.activate(&protocol_id).await?;
            println!("protocol {protocol_id} activated");
            Ok(EXIT_OK)
        }
        Command::ProtocolDeactivate { protocol_id } => {
            controller.registry.deactivate(&protocol_id).await?;
            println!("protocol {protocol_id} deactivated");
            Ok(EXIT_OK)
        }
        Command::ProtocolList => {
            let protocols = controller.registry.list().await;
            print_json(&protocols)
        }
        Command::ProposalSubmit { protocol_file, source, description } => {
            let raw = tokio::fs::read_to_string(&protocol_file).await?;
            let protocol: Protocol = serde_json::from_str(&raw)?;
            let proposal = controller
                .proposals
                .submit(protocol, source.into(), description, None, None)
                .await?;
            print_json(&proposal)
        }
        Command::ProposalApprove { proposal_id } => {
            match controller.proposals.approve(&proposal_id, &controller.registry, None).await {
                Ok(proposal) => print_json(&proposal),
                Err(err) => {
                    eprintln!("approval blocked: {err:#}");
                    Ok(EXIT_CONSTRAINT_BLOCKED)
                }
            }
        }
        Command::ProposalReject { proposal_id, reason } => {
            let proposal = controller.proposals.reject(&proposal_id, reason, None).await?;
            print_json(&proposal)
        }
    }
}

async fn with_session<F>(controller: &SessionController, render: F) -> anyhow::Result<u8>
where
    F: FnOnce(loom_types::Session) -> anyhow::Result<u8>,
{
    match controller.session_status().await {
        Some(session) => render(session),
        None => {
            eprintln!("no session exists for this project");
            Ok(EXIT_SESSION_MISSING)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<u8> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(EXIT_OK)
}
