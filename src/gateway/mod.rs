//! 推理网关：抽象、响应 schema 与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod responses;
pub mod traits;

pub use mock::MockGateway;
pub use openai::{OpenAiGateway, TokenUsage};
pub use traits::{GatewayError, GatewayRequest, ReasoningGateway};
