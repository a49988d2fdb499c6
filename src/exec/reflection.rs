//! 反思闸门
//!
//! 仅对 requires_reflection 的步骤调用：把步骤描述、目标与截断后的结果发给推理网关，
//! 解析出结构化决策。解析失败或网关出错一律 fail-open（continue, 0.5）——
//! 系统优先保证前进，不因反思环节卡死。

use std::sync::Arc;

use serde::Serialize;

use crate::gateway::responses::parse_reflection;
use crate::gateway::traits::{GatewayRequest, ReasoningGateway};
use crate::plan::types::{Step, StepId};

const REFLECT_INSTRUCTION: &str = "You judge whether a step result advances the objective. \
Respond with JSON only: {\"action\": \"continue|retry|revise_plan|skip|abort\", \
\"rationale\": \"...\", \"confidence\": 0.0, \"issues\": [], \"suggestions\": [], \
\"restart_from_step\": null}.";

const PLAN_REFLECT_INSTRUCTION: &str = "You judge whether the accumulated step results satisfy the objective. \
Respond with JSON only: {\"action\": \"continue|revise_plan|abort\", \"rationale\": \"...\", \
\"confidence\": 0.0, \"issues\": [], \"suggestions\": []}.";

/// 反思动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionAction {
    Continue,
    Retry,
    RevisePlan,
    Skip,
    Abort,
}

impl ReflectionAction {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "continue" => Some(Self::Continue),
            "retry" => Some(Self::Retry),
            "revise_plan" => Some(Self::RevisePlan),
            "skip" => Some(Self::Skip),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::RevisePlan => "revise_plan",
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

/// 一次反思的结构化决策；只在会话内存活，不持久化
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionDecision {
    pub step_id: StepId,
    pub action: ReflectionAction,
    pub rationale: Option<String>,
    /// 置信度，[0, 1]
    pub confidence: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub restart_from_step: Option<StepId>,
}

impl ReflectionDecision {
    /// fail-open 默认：继续执行，中等置信
    fn fail_open(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
            action: ReflectionAction::Continue,
            rationale: None,
            confidence: 0.5,
            issues: Vec::new(),
            suggestions: Vec::new(),
            restart_from_step: None,
        }
    }
}

/// 反思闸门：持有网关与结果截断上限
pub struct ReflectionGate {
    gateway: Arc<dyn ReasoningGateway>,
    /// 喂给网关的结果预览上限（字符）
    max_result_chars: usize,
}

impl ReflectionGate {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, max_result_chars: usize) -> Self {
        Self {
            gateway,
            max_result_chars,
        }
    }

    /// 单步反思
    pub async fn reflect(
        &self,
        step: &Step,
        result: &serde_json::Value,
        objective: &str,
    ) -> ReflectionDecision {
        let context = serde_json::json!({
            "step": {
                "id": step.id,
                "description": step.description,
                "kind": step.kind.as_str(),
                "expected_output": step.expected_output,
            },
            "result_preview": self.truncate(&result.to_string()),
        });
        self.query_decision(REFLECT_INSTRUCTION, objective, context, &step.id)
            .await
    }

    /// 整计划终局反思
    pub async fn reflect_on_plan(
        &self,
        objective: &str,
        step_results: &serde_json::Value,
    ) -> ReflectionDecision {
        let context = serde_json::json!({
            "results_preview": self.truncate(&step_results.to_string()),
        });
        self.query_decision(PLAN_REFLECT_INSTRUCTION, objective, context, "plan")
            .await
    }

    async fn query_decision(
        &self,
        instruction: &str,
        objective: &str,
        context: serde_json::Value,
        step_id: &str,
    ) -> ReflectionDecision {
        let raw = match self
            .gateway
            .query(GatewayRequest::new(instruction, objective).with_context(context))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(step_id, "reflection unavailable, failing open: {}", e);
                return ReflectionDecision::fail_open(step_id);
            }
        };

        let Ok(response) = parse_reflection(&raw) else {
            tracing::debug!(step_id, "reflection unparseable, failing open");
            return ReflectionDecision::fail_open(step_id);
        };

        let action = ReflectionAction::parse(&response.action).unwrap_or(ReflectionAction::Continue);
        ReflectionDecision {
            step_id: step_id.to_string(),
            action,
            rationale: response.rationale,
            confidence: response.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            issues: response.issues,
            suggestions: response.suggestions,
            restart_from_step: response.restart_from_step,
        }
    }

    fn truncate(&self, text: &str) -> String {
        if text.chars().count() > self.max_result_chars {
            let preview: String = text.chars().take(self.max_result_chars).collect();
            format!("{}...", preview)
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::plan::types::StepKind;

    fn step() -> Step {
        Step::new("s1", "Check the numbers", StepKind::Verification)
    }

    #[tokio::test]
    async fn test_reflect_parses_decision() {
        let gateway = Arc::new(MockGateway::with_responses(vec![serde_json::json!({
            "action": "retry",
            "rationale": "numbers are off",
            "confidence": 0.8,
            "issues": ["sum mismatch"]
        })
        .to_string()]));
        let gate = ReflectionGate::new(gateway, 1000);

        let decision = gate
            .reflect(&step(), &serde_json::json!({"sum": 41}), "verify totals")
            .await;
        assert_eq!(decision.action, ReflectionAction::Retry);
        assert_eq!(decision.confidence, 0.8);
        assert_eq!(decision.issues, vec!["sum mismatch".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_reflection_fails_open() {
        let gateway = Arc::new(MockGateway::with_responses(vec!["¯\\_(ツ)_/¯".to_string()]));
        let gate = ReflectionGate::new(gateway, 1000);

        let decision = gate.reflect(&step(), &serde_json::Value::Null, "obj").await;
        assert_eq!(decision.action, ReflectionAction::Continue);
        assert_eq!(decision.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_unknown_action_maps_to_continue() {
        let gateway = Arc::new(MockGateway::with_responses(vec![
            r#"{"action": "explode", "confidence": 0.9}"#.to_string(),
        ]));
        let gate = ReflectionGate::new(gateway, 1000);

        let decision = gate.reflect(&step(), &serde_json::Value::Null, "obj").await;
        assert_eq!(decision.action, ReflectionAction::Continue);
    }

    #[tokio::test]
    async fn test_confidence_clamped_to_unit_interval() {
        let gateway = Arc::new(MockGateway::with_responses(vec![
            r#"{"action": "continue", "confidence": 7.5}"#.to_string(),
        ]));
        let gate = ReflectionGate::new(gateway, 1000);

        let decision = gate.reflect(&step(), &serde_json::Value::Null, "obj").await;
        assert_eq!(decision.confidence, 1.0);
    }
}
