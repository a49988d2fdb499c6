//! 核心编排层：错误、恢复、会话状态、取消监管、编排器

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod supervisor;

pub use error::OrchestratorError;
pub use orchestrator::{
    create_gateway_from_config, Orchestrator, OrchestratorBuilder, SessionOutcome,
};
pub use recovery::{ErrorKind, ErrorRecord, RecoveryManager, RecoveryResult, RecoveryStrategy};
pub use state::{
    Checkpoint, CheckpointStore, InMemoryCheckpointStore, Message, SessionId, SessionState,
    SessionStatus, SessionSummary, StateManager,
};
pub use supervisor::SessionSupervisor;
