//! 计划类型定义
//!
//! 定义 Plan、Step、步骤类别与生命周期状态等核心数据类型。
//! Plan 的依赖结构创建后不可变，只有 Step 的 status / result 会原地更新；
//! 修订（revise）产生新 Plan（新 id、同 objective），不在旧 Plan 上改依赖。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::graph::PlanGraph;

pub type PlanId = String;
pub type StepId = String;

/// 步骤类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// 信息检索
    Research,
    /// 分析推理
    Analysis,
    /// 代码相关
    Code,
    /// 网页浏览
    Browsing,
    /// 文件操作
    FileOp,
    /// 通知 / 消息
    Communication,
    /// 结果校验
    Verification,
    /// 汇总产出
    Synthesis,
}

impl StepKind {
    /// 从网关返回的自由文本解析类别；未知值返回 None，由调用方降级为安全默认
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "research" => Some(Self::Research),
            "analysis" => Some(Self::Analysis),
            "code" => Some(Self::Code),
            "browsing" => Some(Self::Browsing),
            "file_op" => Some(Self::FileOp),
            "communication" => Some(Self::Communication),
            "verification" => Some(Self::Verification),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Code => "code",
            Self::Browsing => "browsing",
            Self::FileOp => "file_op",
            Self::Communication => "communication",
            Self::Verification => "verification",
            Self::Synthesis => "synthesis",
        }
    }
}

/// 步骤状态
///
/// 生命周期：Pending -> InProgress -> {Completed | Failed}；
/// Failed 在重试决策下可回到 Pending（受 max_retries 约束）；
/// Skipped 视为依赖已满足，但会向下游传播 degraded 标记。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// 计划中的单个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 步骤 ID（计划内唯一）
    pub id: StepId,
    /// 自然语言描述
    pub description: String,
    /// 类别
    pub kind: StepKind,
    /// 绑定的工具名；为空时走类别默认行为
    pub tool_name: String,
    /// 工具参数（不透明 JSON）
    pub tool_params: serde_json::Value,
    /// 依赖的步骤 ID 集合
    pub dependencies: BTreeSet<StepId>,
    /// 预期输出描述（供反思判断）
    pub expected_output: Option<String>,
    /// 最大重试次数
    pub max_retries: u32,
    /// 已重试次数
    pub retry_count: u32,
    /// 完成后是否触发反思
    pub requires_reflection: bool,
    /// 成功后是否创建检查点
    pub checkpoint: bool,
    /// 当前状态
    pub status: StepStatus,
    /// 执行结果（完成后写入）
    pub result: Option<serde_json::Value>,
    /// 开始时间（毫秒时间戳）
    pub started_at: Option<i64>,
    /// 完成时间
    pub completed_at: Option<i64>,
}

impl Step {
    pub fn new(id: impl Into<StepId>, description: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            tool_name: String::new(),
            tool_params: serde_json::Value::Null,
            dependencies: BTreeSet::new(),
            expected_output: None,
            max_retries: 2,
            retry_count: 0,
            requires_reflection: false,
            checkpoint: false,
            status: StepStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// 是否处于终态
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 一次目标执行的完整计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// 计划 ID
    pub id: PlanId,
    /// 原始目标
    pub objective: String,
    /// 有序步骤列表
    pub steps: Vec<Step>,
    /// 拓扑分波（validate 时派生，不由作者提供）
    pub parallel_groups: Vec<Vec<StepId>>,
    /// 元数据（fallback 标记、修订轮次等）
    pub metadata: serde_json::Value,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl Plan {
    pub fn new(objective: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            objective: objective.into(),
            steps,
            parallel_groups: Vec::new(),
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// 校验并修复计划：
    /// 1. 拒绝重复步骤 ID；
    /// 2. 丢弃引用了不存在步骤的依赖（自动修复，保证引用完整性）；
    /// 3. 通过拓扑排序拒绝依赖环；
    /// 4. 重新派生 parallel_groups（拓扑分波）。
    pub fn validate(&mut self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let ids: BTreeSet<StepId> = self.steps.iter().map(|s| s.id.clone()).collect();
        if ids.len() != self.steps.len() {
            return Err(PlanError::DuplicateStepId);
        }

        for step in &mut self.steps {
            step.dependencies.retain(|dep| ids.contains(dep));
        }

        let graph = PlanGraph::new(&self.steps);
        self.parallel_groups = graph.topological_waves()?;
        Ok(())
    }

    /// 当前可启动的步骤：Pending 且所有依赖均为 Completed 或 Skipped
    pub fn ready_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && self.dependencies_satisfied(s))
            .map(|s| s.id.clone())
            .collect()
    }

    /// 步骤的依赖是否全部满足（Completed 或 Skipped）
    pub fn dependencies_satisfied(&self, step: &Step) -> bool {
        step.dependencies.iter().all(|dep| {
            matches!(
                self.step(dep).map(|s| s.status),
                Some(StepStatus::Completed) | Some(StepStatus::Skipped)
            )
        })
    }

    /// 是否存在被 Skipped 的依赖（向下游传播 degraded 标记）
    pub fn has_skipped_dependency(&self, step: &Step) -> bool {
        step.dependencies
            .iter()
            .any(|dep| self.step(dep).map(|s| s.status) == Some(StepStatus::Skipped))
    }

    /// 是否还有未到终态的步骤
    pub fn has_unfinished(&self) -> bool {
        self.steps.iter().any(|s| !s.is_finished())
    }

    /// 已完成步骤的 ID 集合
    pub fn completed_ids(&self) -> BTreeSet<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }
}

/// 计划错误类型
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("duplicate step id in plan")]
    DuplicateStepId,
    #[error("cyclic dependency detected")]
    CyclicDependency,
    #[error("invalid plan: {0}")]
    Invalid(String),
}
