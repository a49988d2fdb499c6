//! 会话监管：取消令牌生命周期
//!
//! 每个会话一枚 CancellationToken；取消是协作式的——执行循环在波间与修订间检查，
//! 已在途的外部调用不被强行打断。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：按会话分发与触发取消令牌
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（或创建）会话的取消令牌
    pub async fn token_for(&self, session_id: &str) -> CancellationToken {
        if let Some(token) = self.tokens.read().await.get(session_id) {
            return token.clone();
        }
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| token.clone())
            .clone()
    }

    /// 触发会话取消
    pub async fn cancel(&self, session_id: &str) {
        if let Some(token) = self.tokens.read().await.get(session_id) {
            token.cancel();
        }
    }

    /// 会话结束后移除令牌
    pub async fn remove(&self, session_id: &str) {
        self.tokens.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_flips_token() {
        let supervisor = SessionSupervisor::new();
        let token = supervisor.token_for("s1").await;
        assert!(!token.is_cancelled());
        supervisor.cancel("s1").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_tokens_are_per_session() {
        let supervisor = SessionSupervisor::new();
        let a = supervisor.token_for("a").await;
        let b = supervisor.token_for("b").await;
        supervisor.cancel("a").await;
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
