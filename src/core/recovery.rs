//! 错误分类与恢复
//!
//! classify 对错误信息做确定性的有序模式匹配得到 ErrorKind；
//! 每个 ErrorKind 映射一条策略链，attempt_recovery 依次尝试直到某一策略成功或链耗尽。
//! 退避等待 min(2^attempt, 60) 个时间单位（单位 = backoff_base_ms，便于测试压缩时间）。

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gateway::responses::parse_decomposition;
use crate::gateway::traits::{GatewayRequest, ReasoningGateway};

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Validation,
    ResourceUnavailable,
    Execution,
    UpstreamService,
    Automation,
    Io,
    Unknown,
}

/// 已分类的错误记录；创建后不可变
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// 发生现场（step_id、描述等）
    pub context: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    BackoffRetry,
    FallbackWorker,
    Decompose,
    SkipAndContinue,
    ManualIntervention,
    Abort,
}

/// 恢复结果；success=false 且 continue_execution=false 表示调用方应将步骤视为永久失败
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    pub continue_execution: bool,
    /// 生效的策略（未生效时为 None）
    pub strategy: Option<RecoveryStrategy>,
    /// 带回执行循环的新上下文（retry / skip / decomposition / fallback_worker）
    pub new_context: serde_json::Value,
}

impl RecoveryResult {
    fn failed() -> Self {
        Self {
            success: false,
            continue_execution: false,
            strategy: None,
            new_context: serde_json::Value::Null,
        }
    }
}

const DECOMPOSE_INSTRUCTION: &str = "You split a failing task into smaller sub-instructions. \
Respond with JSON only: {\"subtasks\": [{\"description\": \"...\", \"dependencies\": []}]}. \
Each subtask must be smaller and more concrete than the original. Two to four subtasks.";

/// 错误恢复管理器
pub struct RecoveryManager {
    gateway: Arc<dyn ReasoningGateway>,
    /// 一个退避时间单位
    backoff_base: Duration,
    patterns: Vec<(Regex, ErrorKind)>,
}

impl RecoveryManager {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, backoff_base_ms: u64) -> Self {
        // 顺序即优先级；同一条错误信息永远落到同一个类别
        let table: &[(&str, ErrorKind)] = &[
            (r"(?i)timed? ?out|timeout|deadline exceeded", ErrorKind::Timeout),
            (r"(?i)rate limit|too many requests|\b429\b", ErrorKind::RateLimit),
            (r"(?i)unauthorized|forbidden|api key|invalid.{0,10}token|\b401\b|\b403\b", ErrorKind::Auth),
            (r"(?i)bad gateway|service unavailable|upstream|\b502\b|\b503\b", ErrorKind::UpstreamService),
            (r"(?i)connection|network|dns|unreachable|refused|reset by peer", ErrorKind::Network),
            (r"(?i)validation|invalid|malformed|schema|parse error", ErrorKind::Validation),
            (r"(?i)not found|unavailable|no such|missing|\b404\b", ErrorKind::ResourceUnavailable),
            (r"(?i)browser|navigation|page crash|automation|selector", ErrorKind::Automation),
            (r"(?i)permission denied|disk|file system|i/?o error|broken pipe", ErrorKind::Io),
            (r"(?i)panic|exception|execution failed|runtime error", ErrorKind::Execution),
        ];
        let patterns = table
            .iter()
            .map(|(pattern, kind)| (Regex::new(pattern).unwrap(), *kind))
            .collect();

        Self {
            gateway,
            backoff_base: Duration::from_millis(backoff_base_ms),
            patterns,
        }
    }

    /// 分类错误信息：首个命中的模式决定类别，无命中为 Unknown
    pub fn classify(&self, message: &str) -> ErrorKind {
        for (pattern, kind) in &self.patterns {
            if pattern.is_match(message) {
                return *kind;
            }
        }
        ErrorKind::Unknown
    }

    /// 构建不可变错误记录
    pub fn record(
        &self,
        message: impl Into<String>,
        context: serde_json::Value,
        attempt: u32,
        max_attempts: u32,
    ) -> ErrorRecord {
        let message = message.into();
        ErrorRecord {
            kind: self.classify(&message),
            message,
            context,
            attempt,
            max_attempts,
        }
    }

    /// 类别 -> 策略链
    pub fn strategies_for(kind: ErrorKind) -> &'static [RecoveryStrategy] {
        use RecoveryStrategy::*;
        match kind {
            ErrorKind::Network | ErrorKind::UpstreamService => &[BackoffRetry, FallbackWorker],
            ErrorKind::Timeout => &[BackoffRetry, Decompose],
            ErrorKind::RateLimit => &[BackoffRetry],
            ErrorKind::Auth => &[ManualIntervention, Abort],
            ErrorKind::Validation => &[Retry, Decompose],
            ErrorKind::ResourceUnavailable => &[SkipAndContinue, FallbackWorker],
            ErrorKind::Automation => &[BackoffRetry, FallbackWorker],
            ErrorKind::Io => &[Retry, SkipAndContinue],
            ErrorKind::Execution | ErrorKind::Unknown => &[Retry, FallbackWorker, Abort],
        }
    }

    /// 依次尝试策略链；fallback_worker 仅在调用方提供候选时可生效
    pub async fn attempt_recovery(
        &self,
        record: &ErrorRecord,
        fallback_worker: Option<&str>,
    ) -> RecoveryResult {
        for strategy in Self::strategies_for(record.kind) {
            match strategy {
                RecoveryStrategy::Retry => {
                    if record.attempt < record.max_attempts {
                        return RecoveryResult {
                            success: true,
                            continue_execution: true,
                            strategy: Some(*strategy),
                            new_context: serde_json::json!({ "retry": true }),
                        };
                    }
                }
                RecoveryStrategy::BackoffRetry => {
                    if record.attempt < record.max_attempts {
                        let units = 2u64.saturating_pow(record.attempt).min(60);
                        tokio::time::sleep(self.backoff_base * units as u32).await;
                        return RecoveryResult {
                            success: true,
                            continue_execution: true,
                            strategy: Some(*strategy),
                            new_context: serde_json::json!({ "retry": true, "backoff_units": units }),
                        };
                    }
                }
                RecoveryStrategy::FallbackWorker => {
                    if let Some(worker) = fallback_worker {
                        return RecoveryResult {
                            success: true,
                            continue_execution: true,
                            strategy: Some(*strategy),
                            new_context: serde_json::json!({ "fallback_worker": worker }),
                        };
                    }
                }
                RecoveryStrategy::Decompose => {
                    if let Some(subtasks) = self.try_decompose(record).await {
                        return RecoveryResult {
                            success: true,
                            continue_execution: true,
                            strategy: Some(*strategy),
                            new_context: serde_json::json!({ "decomposition": subtasks }),
                        };
                    }
                }
                RecoveryStrategy::SkipAndContinue => {
                    return RecoveryResult {
                        success: true,
                        continue_execution: true,
                        strategy: Some(*strategy),
                        new_context: serde_json::json!({ "skip": true }),
                    };
                }
                RecoveryStrategy::ManualIntervention => {
                    // 无人工通道，记录后交给链上的下一个策略
                    tracing::warn!(kind = ?record.kind, "manual intervention required: {}", record.message);
                }
                RecoveryStrategy::Abort => {
                    return RecoveryResult {
                        success: false,
                        continue_execution: false,
                        strategy: Some(*strategy),
                        new_context: serde_json::Value::Null,
                    };
                }
            }
        }
        RecoveryResult::failed()
    }

    /// 请求网关将失败指令拆成更小的子指令；失败返回 None 交给下一策略
    async fn try_decompose(&self, record: &ErrorRecord) -> Option<Vec<serde_json::Value>> {
        let instruction = record
            .context
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(&record.message)
            .to_string();

        let request = GatewayRequest::new(DECOMPOSE_INSTRUCTION, instruction)
            .with_context(serde_json::json!({ "error": record.message }));

        let raw = self.gateway.query(request).await.ok()?;
        let decomposition = parse_decomposition(&raw).ok()?;
        if decomposition.subtasks.is_empty() {
            return None;
        }
        Some(
            decomposition
                .subtasks
                .into_iter()
                .map(|sub| {
                    serde_json::json!({
                        "description": sub.description,
                        "dependencies": sub.dependencies,
                    })
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;

    fn manager() -> RecoveryManager {
        RecoveryManager::new(Arc::new(MockGateway::new()), 1)
    }

    #[test]
    fn test_classification_is_deterministic() {
        let m = manager();
        for _ in 0..3 {
            assert_eq!(m.classify("request timed out after 30s"), ErrorKind::Timeout);
            assert_eq!(m.classify("HTTP 429 Too Many Requests"), ErrorKind::RateLimit);
            assert_eq!(m.classify("connection refused"), ErrorKind::Network);
            assert_eq!(m.classify("invalid api key"), ErrorKind::Auth);
            assert_eq!(m.classify("schema validation failed"), ErrorKind::Validation);
            assert_eq!(m.classify("resource not found"), ErrorKind::ResourceUnavailable);
            assert_eq!(m.classify("502 bad gateway"), ErrorKind::UpstreamService);
        }
    }

    #[test]
    fn test_unmatched_message_is_unknown() {
        assert_eq!(manager().classify("something odd happened"), ErrorKind::Unknown);
    }

    #[test]
    fn test_timeout_wins_over_network_in_combined_message() {
        // "connection timed out" 同时命中两类模式；顺序保证始终归为 Timeout
        assert_eq!(manager().classify("connection timed out"), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_retry_respects_attempt_budget() {
        let m = manager();
        let within = m.record("validation failed", serde_json::Value::Null, 0, 2);
        let result = m.attempt_recovery(&within, None).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Retry));

        // 预算用尽：Retry 不再生效，Decompose 走 mock 默认（非 JSON 分解）也失败 -> 链耗尽
        let exhausted = m.record("validation failed", serde_json::Value::Null, 2, 2);
        let result = m.attempt_recovery(&exhausted, None).await;
        assert!(!result.success);
        assert!(!result.continue_execution);
    }

    #[tokio::test]
    async fn test_auth_error_aborts() {
        let m = manager();
        let record = m.record("401 unauthorized", serde_json::Value::Null, 0, 3);
        let result = m.attempt_recovery(&record, None).await;
        assert!(!result.success);
        assert!(!result.continue_execution);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Abort));
    }

    #[tokio::test]
    async fn test_resource_unavailable_skips() {
        let m = manager();
        let record = m.record("document not found", serde_json::Value::Null, 0, 1);
        let result = m.attempt_recovery(&record, None).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::SkipAndContinue));
        assert_eq!(record.kind, ErrorKind::ResourceUnavailable);
        assert!(result.new_context["skip"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn test_network_error_falls_back_to_worker_when_retries_exhausted() {
        let m = manager();
        let record = m.record("connection refused", serde_json::Value::Null, 3, 3);

        // 无候选：链耗尽
        let without = m.attempt_recovery(&record, None).await;
        assert!(!without.success);

        // 有候选：fallback-worker 生效
        let with = m.attempt_recovery(&record, Some("backup")).await;
        assert!(with.success);
        assert_eq!(with.strategy, Some(RecoveryStrategy::FallbackWorker));
        assert_eq!(with.new_context["fallback_worker"], "backup");
    }

    #[tokio::test]
    async fn test_timeout_decomposes_when_retries_exhausted() {
        let gateway = MockGateway::with_responses(vec![serde_json::json!({
            "subtasks": [
                {"description": "first half"},
                {"description": "second half"}
            ]
        })
        .to_string()]);
        let m = RecoveryManager::new(Arc::new(gateway), 1);

        let record = m.record(
            "step timed out",
            serde_json::json!({"description": "big slow step"}),
            3,
            3,
        );
        let result = m.attempt_recovery(&record, None).await;
        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Decompose));
        assert_eq!(result.new_context["decomposition"].as_array().unwrap().len(), 2);
    }
}
