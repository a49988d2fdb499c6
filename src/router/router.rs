//! 能力评分路由
//!
//! 对能处理请求的工作者按 能力优先级 + 历史成功率 + 延迟 + 当前负载 打分排序，
//! 并按请求形态选择执行模式：single / sequential / parallel / swarm。
//! single 模式失败时自动按序落到 fallback_workers 重试。

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::core::error::OrchestratorError;
use crate::gateway::traits::ReasoningGateway;
use crate::router::swarm::SwarmCoordinator;
use crate::router::worker::{Candidate, WorkerId, WorkerRegistry, WorkerTask};

/// 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Single,
    Sequential,
    Parallel,
    Swarm,
}

/// 路由请求
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub request_id: String,
    pub description: String,
    /// 必需能力标签
    pub required_capabilities: Vec<String>,
    /// 多阶段流水线（每阶段一个能力标签，如 build -> deploy）
    pub phases: Vec<String>,
    /// 可独立并行的子任务描述
    pub subtasks: Vec<String>,
    pub params: serde_json::Value,
}

impl RouteRequest {
    pub fn new(description: impl Into<String>, required_capabilities: Vec<String>) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            required_capabilities,
            phases: Vec::new(),
            subtasks: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_phases(mut self, phases: Vec<String>) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<String>) -> Self {
        self.subtasks = subtasks;
        self
    }
}

/// 路由决策；按请求派生，不持久化
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub selected_workers: Vec<WorkerId>,
    pub fallback_workers: Vec<WorkerId>,
    pub execution_mode: ExecutionMode,
    pub estimated_duration_ms: u64,
}

/// 候选评分：(10 - priority)*10 + success_rate*100 + max(0, 100 - avg_latency) - load_ratio*50
fn score(candidate: &Candidate) -> f64 {
    let priority = (10.0 - candidate.profile.priority as f64) * 10.0;
    let success = candidate.stats.success_rate * 100.0;
    let latency = (100.0 - candidate.stats.avg_latency_ms).max(0.0);
    let load_ratio =
        candidate.stats.current_load as f64 / candidate.profile.concurrent_limit.max(1) as f64;
    priority + success + latency - load_ratio * 50.0
}

/// Agent 路由器
pub struct AgentRouter {
    registry: Arc<WorkerRegistry>,
    gateway: Arc<dyn ReasoningGateway>,
    max_swarm_workers: usize,
    max_fallbacks: usize,
}

impl AgentRouter {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        gateway: Arc<dyn ReasoningGateway>,
        max_swarm_workers: usize,
        max_fallbacks: usize,
    ) -> Self {
        Self {
            registry,
            gateway,
            // Swarm 上限不超过 5 个工作者
            max_swarm_workers: max_swarm_workers.clamp(1, 5),
            max_fallbacks,
        }
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }

    /// 评分排序 + 模式选择
    pub async fn route_request(&self, request: &RouteRequest) -> Result<RoutingDecision, OrchestratorError> {
        let mut ranked = self.registry.candidates(&request.required_capabilities).await;
        if ranked.is_empty() {
            return Err(OrchestratorError::NoWorkerAvailable(format!(
                "capabilities {:?}",
                request.required_capabilities
            )));
        }
        ranked.sort_by(|a, b| {
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let execution_mode = if request.required_capabilities.len() > 2 {
            ExecutionMode::Swarm
        } else if request.phases.len() > 1 {
            ExecutionMode::Sequential
        } else if !request.subtasks.is_empty() {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Single
        };

        let take = match execution_mode {
            ExecutionMode::Single => 1,
            ExecutionMode::Sequential => request.phases.len().min(ranked.len()),
            ExecutionMode::Parallel => request.subtasks.len().min(ranked.len()),
            ExecutionMode::Swarm => self.max_swarm_workers.min(ranked.len()),
        }
        .max(1);

        let selected_workers: Vec<WorkerId> = ranked
            .iter()
            .take(take)
            .map(|c| c.profile.id.clone())
            .collect();
        let fallback_workers: Vec<WorkerId> = ranked
            .iter()
            .skip(take)
            .take(self.max_fallbacks)
            .map(|c| c.profile.id.clone())
            .collect();

        let per_worker: Vec<u64> = ranked
            .iter()
            .take(take)
            .map(|c| (c.stats.avg_latency_ms as u64).max(100))
            .collect();
        let estimated_duration_ms = match execution_mode {
            ExecutionMode::Single => per_worker[0],
            ExecutionMode::Sequential => per_worker.iter().sum(),
            ExecutionMode::Parallel | ExecutionMode::Swarm => per_worker.iter().copied().max().unwrap_or(100),
        };

        Ok(RoutingDecision {
            request_id: request.request_id.clone(),
            selected_workers,
            fallback_workers,
            execution_mode,
            estimated_duration_ms,
        })
    }

    /// 按决策执行请求
    pub async fn execute_with_routing(
        &self,
        decision: &RoutingDecision,
        request: &RouteRequest,
    ) -> Result<serde_json::Value, OrchestratorError> {
        match decision.execution_mode {
            ExecutionMode::Single => self.execute_single(decision, request).await,
            ExecutionMode::Sequential => self.execute_sequential(decision, request).await,
            ExecutionMode::Parallel => self.execute_parallel(decision, request).await,
            ExecutionMode::Swarm => {
                let swarm = SwarmCoordinator::new(Arc::clone(&self.registry), Arc::clone(&self.gateway));
                swarm.execute(request, &decision.selected_workers).await
            }
        }
    }

    async fn dispatch_to(&self, worker_id: &str, task: &WorkerTask) -> Result<serde_json::Value, String> {
        let Some(worker) = self.registry.get(worker_id).await else {
            return Err(format!("worker {} is not registered", worker_id));
        };
        self.registry.begin_dispatch(worker_id).await;
        let start = Instant::now();
        let result = worker.run(task).await;
        self.registry
            .finish_dispatch(worker_id, result.is_ok(), start.elapsed().as_millis() as u64)
            .await;
        result
    }

    /// 单工作者：选中者失败后按序重试 fallback
    async fn execute_single(
        &self,
        decision: &RoutingDecision,
        request: &RouteRequest,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let task = WorkerTask {
            request_id: request.request_id.clone(),
            description: request.description.clone(),
            role: None,
            params: request.params.clone(),
            context: serde_json::Value::Null,
        };

        let mut last_error = String::new();
        let chain = decision
            .selected_workers
            .iter()
            .chain(decision.fallback_workers.iter());
        for worker_id in chain {
            match self.dispatch_to(worker_id, &task).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(worker_id, "worker failed, trying next: {}", e);
                    last_error = e;
                }
            }
        }
        Err(OrchestratorError::ToolExecutionFailed(format!(
            "all workers failed, last error: {}",
            last_error
        )))
    }

    /// 流水线：阶段按序执行，上一阶段结果进入下一阶段上下文
    async fn execute_sequential(
        &self,
        decision: &RoutingDecision,
        request: &RouteRequest,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let mut previous = serde_json::Value::Null;
        let mut outputs = Vec::with_capacity(request.phases.len());

        for (i, phase) in request.phases.iter().enumerate() {
            // 阶段多于选中工作者时复用末位
            let worker_id = decision
                .selected_workers
                .get(i)
                .or_else(|| decision.selected_workers.last())
                .ok_or_else(|| OrchestratorError::NoWorkerAvailable(format!("phase {}", phase)))?;
            let task = WorkerTask {
                request_id: request.request_id.clone(),
                description: format!("{} (phase: {})", request.description, phase),
                role: Some(phase.clone()),
                params: request.params.clone(),
                context: serde_json::json!({ "previous": previous }),
            };
            let value = self
                .dispatch_to(worker_id, &task)
                .await
                .map_err(OrchestratorError::ToolExecutionFailed)?;
            previous = value.clone();
            outputs.push(serde_json::json!({ "phase": phase, "result": value }));
        }

        Ok(serde_json::Value::Array(outputs))
    }

    /// 并行：每个子任务一个并发任务，按完成顺序收集（不保证提交顺序）
    async fn execute_parallel(
        &self,
        decision: &RoutingDecision,
        request: &RouteRequest,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let mut join_set: JoinSet<serde_json::Value> = JoinSet::new();

        for (i, subtask) in request.subtasks.iter().enumerate() {
            let worker_id = decision.selected_workers[i % decision.selected_workers.len()].clone();
            let Some(worker) = self.registry.get(&worker_id).await else {
                continue;
            };
            let registry = Arc::clone(&self.registry);
            let task = WorkerTask {
                request_id: request.request_id.clone(),
                description: subtask.clone(),
                role: None,
                params: request.params.clone(),
                context: serde_json::Value::Null,
            };
            let subtask = subtask.clone();
            registry.begin_dispatch(&worker_id).await;
            join_set.spawn(async move {
                let start = Instant::now();
                let result = worker.run(&task).await;
                registry
                    .finish_dispatch(&worker_id, result.is_ok(), start.elapsed().as_millis() as u64)
                    .await;
                match result {
                    Ok(value) => serde_json::json!({
                        "subtask": subtask,
                        "worker": worker_id,
                        "result": value,
                    }),
                    Err(e) => serde_json::json!({
                        "subtask": subtask,
                        "worker": worker_id,
                        "error": e,
                    }),
                }
            });
        }

        let mut outputs = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(value) = joined {
                outputs.push(value);
            }
        }
        Ok(serde_json::Value::Array(outputs))
    }
}
