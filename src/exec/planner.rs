//! 任务规划器
//!
//! create_plan 两段式：先请求任务分析（复杂度 / 类型 / 要求），再请求结构化步骤列表；
//! 任一环节失败都降级为固定的两步计划（research -> synthesis），create_plan 永不报错。
//! revise_plan 序列化当前计划与触发反思后重新请求；新计划必须保留所有已完成步骤，
//! 网关给不出可用计划时原样返回旧计划（不丢步骤）。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::exec::reflection::ReflectionDecision;
use crate::gateway::responses::{parse_analysis, parse_plan, PlannedStep};
use crate::gateway::traits::{GatewayRequest, ReasoningGateway};
use crate::plan::types::{Plan, Step, StepKind, StepStatus};

const ANALYZE_INSTRUCTION: &str = "You analyze an objective before planning. \
Respond with JSON only: {\"complexity\": \"low|medium|high\", \"task_type\": \"...\", \"requirements\": [\"...\"]}.";

const PLAN_INSTRUCTION: &str = "You decompose an objective into an executable step list. \
Respond with JSON only: {\"steps\": [{\"id\": \"step_1\", \"description\": \"...\", \
\"kind\": \"research|analysis|code|browsing|file_op|communication|verification|synthesis\", \
\"tool_name\": \"...\", \"tool_params\": {}, \"dependencies\": [], \
\"requires_reflection\": false, \"checkpoint\": false}]}. \
Dependencies reference earlier step ids. Keep the plan minimal; end with a synthesis step.";

const REVISE_INSTRUCTION: &str = "You revise an execution plan after a reflection flagged problems. \
Keep every completed step unchanged (same id). Replace the steps at or after the restart point. \
Respond with the same JSON shape as planning: {\"steps\": [...]}.";

/// 任务规划器：持有推理网关，产出经过校验的 Plan
pub struct TaskPlanner {
    gateway: Arc<dyn ReasoningGateway>,
    /// 网关未给步骤重试数时的默认值
    default_max_retries: u32,
}

impl TaskPlanner {
    pub fn new(gateway: Arc<dyn ReasoningGateway>, default_max_retries: u32) -> Self {
        Self {
            gateway,
            default_max_retries,
        }
    }

    /// 创建计划；任何失败都落到两步降级计划，绝不向上抛错
    pub async fn create_plan(&self, objective: &str, context: serde_json::Value) -> Plan {
        match self.try_create_plan(objective, context).await {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::warn!("planning degraded to fallback: {}", reason);
                self.fallback_plan(objective)
            }
        }
    }

    async fn try_create_plan(
        &self,
        objective: &str,
        context: serde_json::Value,
    ) -> Result<Plan, String> {
        // 第一阶段：任务分析；分析失败不致命，带默认值进入规划
        let analysis = match self
            .gateway
            .query(GatewayRequest::new(ANALYZE_INSTRUCTION, objective).with_context(context.clone()))
            .await
        {
            Ok(raw) => parse_analysis(&raw).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("task analysis unavailable: {}", e);
                Default::default()
            }
        };

        let plan_context = serde_json::json!({
            "analysis": {
                "complexity": analysis.complexity,
                "task_type": analysis.task_type,
                "requirements": analysis.requirements,
            },
            "caller_context": context,
        });

        let raw = self
            .gateway
            .query(GatewayRequest::new(PLAN_INSTRUCTION, objective).with_context(plan_context))
            .await
            .map_err(|e| e.to_string())?;
        let response = parse_plan(&raw).map_err(|e| e.to_string())?;
        if response.steps.is_empty() {
            return Err("gateway returned an empty step list".to_string());
        }

        let steps: Vec<Step> = response
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, planned)| self.materialize_step(planned, i))
            .collect();

        let mut plan = Plan::new(objective, steps);
        plan.validate().map_err(|e| e.to_string())?;
        Ok(plan)
    }

    /// 将网关返回的步骤落成 Step；未知 kind / 缺失字段一律降级为安全默认
    fn materialize_step(&self, planned: PlannedStep, index: usize) -> Step {
        let id = planned
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("step_{}", index + 1));
        let kind = planned
            .kind
            .as_deref()
            .and_then(StepKind::parse)
            .unwrap_or(StepKind::Research);

        let mut step = Step::new(id, planned.description, kind);
        step.tool_name = planned.tool_name.unwrap_or_default();
        step.tool_params = planned.tool_params.unwrap_or(serde_json::Value::Null);
        step.dependencies = planned.dependencies.into_iter().collect();
        step.expected_output = planned.expected_output;
        step.max_retries = planned.max_retries.unwrap_or(self.default_max_retries);
        step.requires_reflection = planned.requires_reflection.unwrap_or(false);
        step.checkpoint = planned.checkpoint.unwrap_or(false);
        step
    }

    /// 固定两步降级计划：research -> synthesis，metadata.fallback=true
    pub fn fallback_plan(&self, objective: &str) -> Plan {
        let mut research = Step::new(
            "step_1",
            format!("Research the objective: {}", objective),
            StepKind::Research,
        );
        research.max_retries = self.default_max_retries;

        let mut synthesize = Step::new(
            "step_2",
            "Synthesize a response from what was found",
            StepKind::Synthesis,
        );
        synthesize.max_retries = self.default_max_retries;
        synthesize.dependencies = BTreeSet::from(["step_1".to_string()]);

        let mut plan = Plan::new(objective, vec![research, synthesize]);
        plan.metadata = serde_json::json!({ "fallback": true });
        // 两个固定步骤，校验不可能失败
        plan.validate().ok();
        plan
    }

    /// 按反思结果修订计划：保留已完成步骤，替换重启点之后的部分；
    /// 网关给不出可用计划时返回原计划（克隆），不做静默丢步
    pub async fn revise_plan(
        &self,
        plan: &Plan,
        reflection: &ReflectionDecision,
        context: serde_json::Value,
    ) -> Plan {
        match self.try_revise_plan(plan, reflection, context).await {
            Ok(revised) => revised,
            Err(reason) => {
                tracing::warn!("plan revision unusable, keeping current plan: {}", reason);
                plan.clone()
            }
        }
    }

    async fn try_revise_plan(
        &self,
        plan: &Plan,
        reflection: &ReflectionDecision,
        context: serde_json::Value,
    ) -> Result<Plan, String> {
        let serialized_steps: Vec<serde_json::Value> = plan
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "description": s.description,
                    "kind": s.kind.as_str(),
                    "status": s.status,
                    "dependencies": s.dependencies,
                })
            })
            .collect();

        let revision_context = serde_json::json!({
            "current_plan": serialized_steps,
            "reflection": {
                "action": reflection.action.as_str(),
                "rationale": reflection.rationale,
                "issues": reflection.issues,
                "suggestions": reflection.suggestions,
                "restart_from_step": reflection.restart_from_step,
            },
            "caller_context": context,
        });

        let raw = self
            .gateway
            .query(GatewayRequest::new(REVISE_INSTRUCTION, &plan.objective).with_context(revision_context))
            .await
            .map_err(|e| e.to_string())?;
        let response = parse_plan(&raw).map_err(|e| e.to_string())?;
        if response.steps.is_empty() {
            return Err("revision returned an empty step list".to_string());
        }

        // 已完成（含已跳过）的步骤原样保留，网关同 id 的重复步骤被忽略
        let preserved: Vec<Step> = plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
            .cloned()
            .collect();
        let preserved_ids: BTreeSet<String> = preserved.iter().map(|s| s.id.clone()).collect();

        let mut steps = preserved;
        for (i, planned) in response.steps.into_iter().enumerate() {
            let step = self.materialize_step(planned, i);
            if !preserved_ids.contains(&step.id) {
                steps.push(step);
            }
        }

        let mut revised = Plan::new(plan.objective.clone(), steps);
        revised.metadata = serde_json::json!({
            "revised_from": plan.id,
            "trigger_step": reflection.step_id,
        });
        revised.validate().map_err(|e| e.to_string())?;

        // 保留校验：任何一个已完成步骤丢失都判为不可用修订
        let completed_before = plan.completed_ids();
        let ids_after: BTreeSet<String> = revised.steps.iter().map(|s| s.id.clone()).collect();
        if !completed_before.is_subset(&ids_after) {
            return Err("revision dropped completed steps".to_string());
        }

        Ok(revised)
    }
}
