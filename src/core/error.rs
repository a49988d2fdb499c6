//! 编排错误类型
//!
//! 工具 / 网关错误不会以语言级异常穿透执行循环边界：循环内部统一转 ErrorRecord 处理，
//! 只有死锁、恢复耗尽与显式 abort 以 OrchestratorError 形式向会话层传播。

use thiserror::Error;

use crate::gateway::traits::GatewayError;
use crate::plan::types::PlanError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("plan deadlock, stuck steps: {stuck:?}")]
    PlanDeadlock { stuck: Vec<String> },

    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("tool timeout: {0}")]
    ToolTimeout(String),

    #[error("no worker available: {0}")]
    NoWorkerAvailable(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("execution aborted: {0}")]
    Aborted(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}
