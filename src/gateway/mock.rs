//! Mock 推理网关（用于测试，无需 API）
//!
//! 按 FIFO 弹出脚本化回复；队列为空时返回确定性的汇总 JSON，
//! 保证无 Key 环境下规划降级、执行与汇总全链路可跑通。

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::gateway::traits::{GatewayError, GatewayRequest, ReasoningGateway};

/// Mock 网关：脚本化回复队列
#[derive(Debug, Default)]
pub struct MockGateway {
    scripted: Mutex<VecDeque<String>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            scripted: Mutex::new(responses.into()),
        }
    }

    /// 追加一条脚本化回复
    pub async fn push_response(&self, response: impl Into<String>) {
        self.scripted.lock().await.push_back(response.into());
    }
}

#[async_trait]
impl ReasoningGateway for MockGateway {
    async fn query(&self, request: GatewayRequest) -> Result<String, GatewayError> {
        if let Some(scripted) = self.scripted.lock().await.pop_front() {
            return Ok(scripted);
        }

        let objective: String = request.objective.chars().take(120).collect();
        Ok(serde_json::json!({ "text": format!("Summary of: {}", objective) }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_pop_in_order() {
        let gateway = MockGateway::with_responses(vec!["one".into(), "two".into()]);
        let req = GatewayRequest::new("sys", "obj");
        assert_eq!(gateway.query(req.clone()).await.unwrap(), "one");
        assert_eq!(gateway.query(req.clone()).await.unwrap(), "two");
        // 队列耗尽后落到确定性汇总
        let fallback = gateway.query(req).await.unwrap();
        assert!(fallback.contains("Summary of"));
    }
}
