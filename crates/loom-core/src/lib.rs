//! Durable state, path safety, configuration, logging and the in-process
//! event bus shared by every other crate in the orchestration engine.

pub mod atomic;
pub mod config;
pub mod event_bus;
pub mod observability;
pub mod paths;
pub mod storage;

pub use atomic::write_json_atomic;
pub use config::{ConfigLayers, ConfigStore};
pub use event_bus::{EngineEvent, EventBus};
pub use observability::{init_logging, LoggingInitInfo};
pub use paths::{resolve_inside, validate_project_dir, OrchestratorPaths};
pub use storage::Storage;
