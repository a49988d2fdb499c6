//! 推理网关抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ReasoningGateway：query 接收结构化请求，
//! 返回原始文本；各调用点自行用 responses 模块做严格的 schema 解析。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// 一次推理请求：系统指令 + 目标 + 上下文
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    /// 系统指令（期望输出 schema 在此声明）
    pub system_instruction: String,
    /// 目标 / 用户侧内容
    pub objective: String,
    /// 附加上下文（不透明 JSON）
    pub context: serde_json::Value,
}

impl GatewayRequest {
    pub fn new(system_instruction: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            objective: objective.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// 网关错误；Malformed 一律走调用点的降级路径，不会向上冒泡为致命错误
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
}

/// 推理网关 trait：消费方，不在本仓库内实现自然语言理解本身
#[async_trait]
pub trait ReasoningGateway: Send + Sync {
    /// 发送请求，返回原始文本回复
    async fn query(&self, request: GatewayRequest) -> Result<String, GatewayError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
