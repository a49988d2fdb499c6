//! 计划构建器
//!
//! 提供流畅的 API 构建计划；build 时统一校验（重复 ID、悬挂依赖、环）。

use crate::plan::types::{Plan, PlanError, Step, StepId, StepKind};

/// 计划构建器
pub struct PlanBuilder {
    objective: String,
    steps: Vec<Step>,
    metadata: serde_json::Value,
}

impl PlanBuilder {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            steps: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }

    /// 添加步骤
    pub fn step(mut self, id: impl Into<StepId>, description: impl Into<String>, kind: StepKind) -> Self {
        self.steps.push(Step::new(id, description, kind));
        self
    }

    /// 为最后添加的步骤绑定工具
    pub fn with_tool(mut self, tool_name: impl Into<String>, params: serde_json::Value) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.tool_name = tool_name.into();
            step.tool_params = params;
        }
        self
    }

    /// 为指定步骤声明依赖
    pub fn depends_on(mut self, step_id: impl Into<StepId>, deps: Vec<StepId>) -> Self {
        let id = step_id.into();
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.dependencies.extend(deps);
        }
        self
    }

    /// 为最后添加的步骤设置最大重试次数
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.max_retries = max_retries;
        }
        self
    }

    /// 为最后添加的步骤开启反思
    pub fn with_reflection(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.requires_reflection = true;
        }
        self
    }

    /// 为最后添加的步骤开启检查点
    pub fn with_checkpoint(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.checkpoint = true;
        }
        self
    }

    /// 为最后添加的步骤设置预期输出
    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.expected_output = Some(expected.into());
        }
        self
    }

    /// 设置计划元数据
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self) -> Result<Plan, PlanError> {
        let mut plan = Plan::new(self.objective, self.steps);
        plan.metadata = self.metadata;
        plan.validate()?;
        Ok(plan)
    }
}
