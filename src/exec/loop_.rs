//! 执行主循环
//!
//! 按波推进：每一轮取出所有依赖已满足的 Pending 步骤并发执行（受 fan-out 上限约束），
//! join 完本波再算下一波。失败转 ErrorRecord 走恢复链（重试 / 退避 / 分解 / 跳过）；
//! 反思决策驱动 continue / retry / revise_plan / skip / abort；
//! 取消在波间与修订间生效，在途步骤允许跑完。
//! 一轮启动数为零而 Pending 仍存在时判定计划死锁，中止而非空转。

use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::error::OrchestratorError;
use crate::core::recovery::RecoveryManager;
use crate::core::state::{SessionStatus, StateManager};
use crate::exec::events::{EventBus, EventKind};
use crate::exec::planner::TaskPlanner;
use crate::exec::reflection::{ReflectionAction, ReflectionDecision, ReflectionGate};
use crate::gateway::responses::parse_synthesis;
use crate::gateway::traits::{GatewayRequest, ReasoningGateway};
use crate::plan::types::{Plan, Step, StepId, StepKind, StepStatus};
use crate::tools::ToolExecutor;

const SYNTH_INSTRUCTION: &str = "You produce the final answer for an objective from accumulated step results. \
Partial results are acceptable; summarize what was achieved. \
Respond with JSON only: {\"text\": \"...\"}.";

/// 执行循环配置
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// 同波并发上限（fan-out）
    pub max_parallel_steps: usize,
    /// 计划修订预算
    pub max_plan_revisions: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            max_plan_revisions: 3,
        }
    }
}

/// 单步执行结果
#[derive(Debug)]
pub struct StepResult {
    pub step_id: StepId,
    pub output: Result<serde_json::Value, String>,
    pub duration_ms: u64,
}

/// 一次完整运行的结果
#[derive(Debug)]
pub struct RunOutcome {
    pub status: SessionStatus,
    pub summary: String,
    pub plan: Plan,
}

/// 波 join 后统一应用的控制流决定（修订 / 中止延迟到波边界，保持结构化并发）
#[derive(Default)]
struct WaveVerdict {
    revise: Option<ReflectionDecision>,
    abort: Option<String>,
}

/// 执行循环：依赖注入所有协作方，自身不持有全局状态
pub struct ExecutionLoop {
    gateway: Arc<dyn ReasoningGateway>,
    tools: Arc<ToolExecutor>,
    recovery: Arc<RecoveryManager>,
    state: Arc<StateManager>,
    events: EventBus,
    config: LoopConfig,
}

impl ExecutionLoop {
    pub fn new(
        gateway: Arc<dyn ReasoningGateway>,
        tools: Arc<ToolExecutor>,
        recovery: Arc<RecoveryManager>,
        state: Arc<StateManager>,
        events: EventBus,
        config: LoopConfig,
    ) -> Self {
        Self {
            gateway,
            tools,
            recovery,
            state,
            events,
            config,
        }
    }

    /// 驱动整个计划直到终态；只有死锁以 Err 向上传播，其余路径都返回 RunOutcome
    pub async fn run(
        &self,
        session_id: &str,
        mut plan: Plan,
        planner: &TaskPlanner,
        reflection: &ReflectionGate,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let objective = plan.objective.clone();
        self.state.set_plan(session_id, plan.id.clone()).await?;
        self.state.set_status(session_id, SessionStatus::Running).await?;
        self.events.publish(EventKind::PlanCreated {
            plan_id: plan.id.clone(),
            objective: objective.clone(),
            steps: plan.steps.len(),
        });

        let mut revisions = 0u32;

        loop {
            if cancel.is_cancelled() {
                return self
                    .finish(session_id, plan, &objective, SessionStatus::Cancelled, "cancelled")
                    .await;
            }

            let ready = plan.ready_steps();
            if ready.is_empty() {
                if plan.has_unfinished() {
                    let stuck: Vec<StepId> = plan
                        .steps
                        .iter()
                        .filter(|s| !s.is_finished())
                        .map(|s| s.id.clone())
                        .collect();
                    self.events.publish(EventKind::ExecutionError {
                        session_id: session_id.to_string(),
                        error: format!("plan deadlock, stuck steps: {:?}", stuck),
                    });
                    self.state.set_status(session_id, SessionStatus::Failed).await?;
                    return Err(OrchestratorError::PlanDeadlock { stuck });
                }
                break;
            }

            let verdict = self
                .run_wave(session_id, &mut plan, reflection, ready, &objective)
                .await?;

            if let Some(reason) = verdict.abort {
                return self
                    .finish(session_id, plan, &objective, SessionStatus::Aborted, &reason)
                    .await;
            }

            if let Some(decision) = verdict.revise {
                if cancel.is_cancelled() {
                    return self
                        .finish(session_id, plan, &objective, SessionStatus::Cancelled, "cancelled")
                        .await;
                }
                if revisions >= self.config.max_plan_revisions {
                    return self
                        .finish(
                            session_id,
                            plan,
                            &objective,
                            SessionStatus::Aborted,
                            "plan revision budget exhausted",
                        )
                        .await;
                }
                revisions += 1;
                let context = self.session_context(session_id).await;
                let revised = planner.revise_plan(&plan, &decision, context).await;
                if revised.id != plan.id {
                    plan = revised;
                    self.state.set_plan(session_id, plan.id.clone()).await?;
                    self.events.publish(EventKind::PlanRevised {
                        plan_id: plan.id.clone(),
                        revision: revisions,
                    });
                }
            }
        }

        // 终局反思：对整个计划做一次判断，abort 之外仅作记录
        let results = self.collected_results(session_id).await;
        let final_decision = reflection.reflect_on_plan(&objective, &results).await;
        self.events.publish(EventKind::ReflectionResult {
            step_id: final_decision.step_id.clone(),
            action: final_decision.action.as_str().to_string(),
            confidence: final_decision.confidence,
        });
        if final_decision.action == ReflectionAction::Abort {
            let reason = final_decision
                .rationale
                .unwrap_or_else(|| "final reflection aborted the run".to_string());
            return self
                .finish(session_id, plan, &objective, SessionStatus::Aborted, &reason)
                .await;
        }

        self.finish(session_id, plan, &objective, SessionStatus::Completed, "completed")
            .await
    }

    /// 启动一波步骤并按完成顺序消费结果
    async fn run_wave(
        &self,
        session_id: &str,
        plan: &mut Plan,
        reflection: &ReflectionGate,
        ready: Vec<StepId>,
        objective: &str,
    ) -> Result<WaveVerdict, OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps.max(1)));
        let mut join_set: JoinSet<StepResult> = JoinSet::new();

        for step_id in ready {
            let context = {
                let step = plan
                    .step(&step_id)
                    .ok_or_else(|| OrchestratorError::Plan(crate::plan::types::PlanError::Invalid(
                        format!("ready step {} vanished", step_id),
                    )))?;
                self.step_context(session_id, plan, step).await
            };

            let (kind, description, tool_name, tool_params) = {
                let step = plan.step_mut(&step_id).expect("step existence checked above");
                step.status = StepStatus::InProgress;
                step.started_at = Some(chrono::Utc::now().timestamp_millis());
                (
                    step.kind,
                    step.description.clone(),
                    step.tool_name.clone(),
                    step.tool_params.clone(),
                )
            };

            self.state
                .set_current_step(session_id, Some(step_id.clone()))
                .await?;
            self.events.publish(EventKind::StepStarted {
                step_id: step_id.clone(),
                description: description.clone(),
            });

            let tools = Arc::clone(&self.tools);
            let gateway = Arc::clone(&self.gateway);
            let permits = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore closed");
                let start = Instant::now();
                // 处理器 panic 也收敛为普通失败，不穿透循环边界
                let output = std::panic::AssertUnwindSafe(dispatch(
                    &tools,
                    &gateway,
                    kind,
                    &description,
                    &tool_name,
                    tool_params,
                    context,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err("execution failed: step task panicked".to_string()));
                StepResult {
                    step_id,
                    output,
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            });
        }

        let mut verdict = WaveVerdict::default();
        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // 不可达：dispatch 已 catch_unwind；留日志，受影响步骤会以死锁诊断收尾
                    tracing::error!("wave task join failed: {}", e);
                    continue;
                }
            };
            self.apply_step_result(session_id, plan, reflection, result, objective, &mut verdict)
                .await?;
        }
        Ok(verdict)
    }

    /// 将单步结果写回计划与会话，并执行反思 / 恢复决策
    async fn apply_step_result(
        &self,
        session_id: &str,
        plan: &mut Plan,
        reflection: &ReflectionGate,
        result: StepResult,
        objective: &str,
        verdict: &mut WaveVerdict,
    ) -> Result<(), OrchestratorError> {
        let step_id = result.step_id.clone();
        match result.output {
            Ok(value) => {
                let (wants_checkpoint, wants_reflection) = {
                    let Some(step) = plan.step_mut(&step_id) else {
                        return Ok(());
                    };
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(chrono::Utc::now().timestamp_millis());
                    step.result = Some(value.clone());
                    (step.checkpoint, step.requires_reflection)
                };

                self.state
                    .add_step_result(session_id, step_id.clone(), value.clone())
                    .await?;
                self.events.publish(EventKind::StepCompleted {
                    step_id: step_id.clone(),
                });

                if wants_checkpoint {
                    let checkpoint = self.state.create_checkpoint(session_id, &step_id).await?;
                    self.events.publish(EventKind::CheckpointCreated {
                        label: checkpoint.label,
                    });
                }

                if wants_reflection {
                    let snapshot = plan
                        .step(&step_id)
                        .cloned()
                        .expect("reflected step still in plan");
                    let decision = reflection.reflect(&snapshot, &value, objective).await;
                    self.events.publish(EventKind::ReflectionResult {
                        step_id: step_id.clone(),
                        action: decision.action.as_str().to_string(),
                        confidence: decision.confidence,
                    });
                    self.apply_reflection(plan, &step_id, decision, verdict);
                }
            }
            Err(message) => {
                let (attempt, max_attempts, description) = {
                    let Some(step) = plan.step_mut(&step_id) else {
                        return Ok(());
                    };
                    step.retry_count += 1;
                    step.status = StepStatus::Failed;
                    (step.retry_count, step.max_retries, step.description.clone())
                };

                self.events.publish(EventKind::StepFailed {
                    step_id: step_id.clone(),
                    error: message.clone(),
                });

                let record = self.recovery.record(
                    message,
                    serde_json::json!({ "step_id": step_id, "description": description }),
                    attempt,
                    max_attempts,
                );
                let recovery = self.recovery.attempt_recovery(&record, None).await;

                if recovery.success {
                    if recovery
                        .new_context
                        .get("skip")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        if let Some(step) = plan.step_mut(&step_id) {
                            step.status = StepStatus::Skipped;
                        }
                    } else if let Some(parts) = recovery
                        .new_context
                        .get("decomposition")
                        .and_then(|v| v.as_array())
                    {
                        splice_decomposition(plan, &step_id, parts);
                    } else {
                        // 重试：回到 Pending，下一波重新调度
                        if let Some(step) = plan.step_mut(&step_id) {
                            step.status = StepStatus::Pending;
                        }
                        self.events.publish(EventKind::StepRetry {
                            step_id: step_id.clone(),
                            attempt,
                        });
                    }
                } else {
                    // 恢复链耗尽：永久失败，直接下游降级为 Skipped（degraded 传播）
                    self.mark_dependents_skipped(plan, &step_id);
                }
            }
        }
        Ok(())
    }

    /// 反思决策落地；revise / abort 延迟到波边界统一应用
    fn apply_reflection(
        &self,
        plan: &mut Plan,
        step_id: &str,
        decision: ReflectionDecision,
        verdict: &mut WaveVerdict,
    ) {
        match decision.action {
            ReflectionAction::Continue => {}
            ReflectionAction::Retry => {
                // 重试前重新校验依赖仍满足（上游可能已被修订替换）
                let deps_ok = plan
                    .step(step_id)
                    .map(|s| plan.dependencies_satisfied(s))
                    .unwrap_or(false);
                if let Some(step) = plan.step_mut(step_id) {
                    if step.retry_count < step.max_retries && deps_ok {
                        step.retry_count += 1;
                        step.status = StepStatus::Pending;
                        step.result = None;
                        step.completed_at = None;
                        let attempt = step.retry_count;
                        self.events.publish(EventKind::StepRetry {
                            step_id: step_id.to_string(),
                            attempt,
                        });
                    }
                }
            }
            ReflectionAction::Skip => {
                if let Some(step) = plan.step_mut(step_id) {
                    step.status = StepStatus::Skipped;
                }
            }
            ReflectionAction::RevisePlan => {
                verdict.revise = Some(decision);
            }
            ReflectionAction::Abort => {
                verdict.abort = Some(
                    decision
                        .rationale
                        .unwrap_or_else(|| format!("reflection on {} aborted the run", step_id)),
                );
            }
        }
    }

    /// 永久失败步骤的直接下游标记 Skipped；更深的下游经 Skipped 依赖继续（降级）
    fn mark_dependents_skipped(&self, plan: &mut Plan, failed_id: &str) {
        let dependents: Vec<StepId> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending && s.dependencies.contains(failed_id))
            .map(|s| s.id.clone())
            .collect();
        for id in dependents {
            if let Some(step) = plan.step_mut(&id) {
                step.status = StepStatus::Skipped;
            }
        }
    }

    /// 组装步骤执行上下文：会话上下文 + 上游依赖结果 + degraded 标记
    async fn step_context(&self, session_id: &str, plan: &Plan, step: &Step) -> serde_json::Value {
        let session_context = self.session_context(session_id).await;
        let mut dependency_results = serde_json::Map::new();
        for dep in &step.dependencies {
            if let Some(result) = plan.step(dep).and_then(|s| s.result.clone()) {
                dependency_results.insert(dep.clone(), result);
            }
        }
        serde_json::json!({
            "objective": plan.objective,
            "session": session_context,
            "dependencies": dependency_results,
            "degraded": plan.has_skipped_dependency(step),
        })
    }

    async fn session_context(&self, session_id: &str) -> serde_json::Value {
        match self.state.get(session_id).await {
            Some(session) => serde_json::json!(session.context),
            None => serde_json::Value::Null,
        }
    }

    async fn collected_results(&self, session_id: &str) -> serde_json::Value {
        match self.state.get(session_id).await {
            Some(session) => serde_json::json!(session.step_results),
            None => serde_json::Value::Null,
        }
    }

    /// 终态收束：无论结局如何都尝试产出汇总文本，调用方拿到的永远不是裸错误
    async fn finish(
        &self,
        session_id: &str,
        plan: Plan,
        objective: &str,
        status: SessionStatus,
        reason: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        let summary = self.synthesize(session_id, objective, &plan).await;
        self.state
            .add_message(session_id, "assistant", summary.clone())
            .await?;
        self.state.set_current_step(session_id, None).await?;
        self.state.set_status(session_id, status).await?;

        match status {
            SessionStatus::Completed => self.events.publish(EventKind::ExecutionCompleted {
                session_id: session_id.to_string(),
            }),
            _ => self.events.publish(EventKind::ExecutionAborted {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            }),
        }

        Ok(RunOutcome {
            status,
            summary,
            plan,
        })
    }

    /// 汇总：网关优先，失败时退化为本地拼接的进度摘要（保证非空）
    async fn synthesize(&self, session_id: &str, objective: &str, plan: &Plan) -> String {
        let results = self.collected_results(session_id).await;
        let request = GatewayRequest::new(SYNTH_INSTRUCTION, objective)
            .with_context(serde_json::json!({ "step_results": results }));

        if let Ok(raw) = self.gateway.query(request).await {
            if let Ok(parsed) = parse_synthesis(&raw) {
                if !parsed.text.trim().is_empty() {
                    return parsed.text;
                }
            }
            let trimmed = raw.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('{') {
                return trimmed.to_string();
            }
        }

        let completed = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        format!(
            "Objective: {}. Completed {} of {} steps; partial results are recorded in the session.",
            objective,
            completed,
            plan.steps.len()
        )
    }
}

/// 工具分派：注册了处理器就调用，否则按类别降级为直接询问推理网关
async fn dispatch(
    tools: &ToolExecutor,
    gateway: &Arc<dyn ReasoningGateway>,
    kind: StepKind,
    description: &str,
    tool_name: &str,
    tool_params: serde_json::Value,
    context: serde_json::Value,
) -> Result<serde_json::Value, String> {
    if tools.has_tool(tool_name) {
        return tools
            .execute(tool_name, tool_params, context)
            .await
            .map_err(|e| e.to_string());
    }

    let instruction = default_instruction(kind);
    let request = GatewayRequest::new(instruction, description).with_context(context);
    gateway
        .query(request)
        .await
        .map(|text| serde_json::json!({ "text": text }))
        .map_err(|e| e.to_string())
}

fn default_instruction(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Research | StepKind::Browsing => {
            "Answer from your own knowledge; no tool is available for this research step."
        }
        StepKind::Analysis | StepKind::Verification => {
            "Analyze the given context and report your conclusion."
        }
        StepKind::Synthesis => "Summarize the dependency results for the objective.",
        StepKind::Code | StepKind::FileOp | StepKind::Communication => {
            "Describe the outcome this step would produce; no executor is registered for it."
        }
    }
}

/// 把失败步骤原位替换为网关给出的串行子步骤；下游依赖改指向最后一个子步骤
fn splice_decomposition(plan: &mut Plan, failed_id: &str, parts: &[serde_json::Value]) {
    let Some(failed) = plan.step(failed_id).cloned() else {
        return;
    };
    if parts.is_empty() {
        return;
    }

    let mut new_steps: Vec<Step> = Vec::with_capacity(parts.len());
    let mut prev: Option<StepId> = None;
    for (i, part) in parts.iter().enumerate() {
        let id = format!("{}_part{}", failed_id, i + 1);
        let description = part
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(&failed.description);
        let mut step = Step::new(&id, description, failed.kind);
        step.tool_name = failed.tool_name.clone();
        step.tool_params = failed.tool_params.clone();
        step.max_retries = failed.max_retries;
        step.dependencies = match &prev {
            Some(prev_id) => std::iter::once(prev_id.clone()).collect(),
            None => failed.dependencies.clone(),
        };
        prev = Some(id);
        new_steps.push(step);
    }
    let last = prev.expect("parts checked non-empty");

    for step in &mut plan.steps {
        if step.dependencies.remove(failed_id) {
            step.dependencies.insert(last.clone());
        }
    }
    if let Some(pos) = plan.steps.iter().position(|s| s.id == failed_id) {
        plan.steps.splice(pos..=pos, new_steps);
    }
    // 子步骤拓扑必然无环；重算 parallel_groups
    if let Err(e) = plan.validate() {
        tracing::warn!("plan invalid after decomposition splice: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::InMemoryCheckpointStore;
    use crate::gateway::mock::MockGateway;
    use crate::plan::builder::PlanBuilder;
    use crate::tools::registry::{ToolHandler, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// 记录调用顺序的工具
    struct RecordingTool {
        name: &'static str,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolHandler for RecordingTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "records invocation order"
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _context: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            self.order.lock().unwrap().push(self.name.to_string());
            Ok(serde_json::json!({ "done": self.name }))
        }
    }

    /// 永远超时的工具
    struct AlwaysTimeoutTool {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ToolHandler for AlwaysTimeoutTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "always reports a timeout"
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _context: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("operation timed out".to_string())
        }
    }

    struct Fixture {
        state: Arc<StateManager>,
        exec_loop: ExecutionLoop,
        planner: TaskPlanner,
        reflection: ReflectionGate,
        session_id: String,
    }

    async fn fixture(registry: ToolRegistry, gateway: Arc<MockGateway>) -> Fixture {
        let state = Arc::new(StateManager::new(Arc::new(InMemoryCheckpointStore::default())));
        let session_id = state.create_session("test objective").await;
        let tools = Arc::new(ToolExecutor::new(registry, 5));
        let recovery = Arc::new(RecoveryManager::new(gateway.clone() as Arc<dyn ReasoningGateway>, 1));
        let events = EventBus::new(64);
        let exec_loop = ExecutionLoop::new(
            gateway.clone() as Arc<dyn ReasoningGateway>,
            tools,
            recovery,
            Arc::clone(&state),
            events,
            LoopConfig::default(),
        );
        let planner = TaskPlanner::new(gateway.clone() as Arc<dyn ReasoningGateway>, 2);
        let reflection = ReflectionGate::new(gateway as Arc<dyn ReasoningGateway>, 1000);
        Fixture {
            state,
            exec_loop,
            planner,
            reflection,
            session_id,
        }
    }

    #[tokio::test]
    async fn test_synthesis_waits_for_research() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry.register(RecordingTool {
            name: "probe",
            order: Arc::clone(&order),
        });
        registry.register(RecordingTool {
            name: "writeup",
            order: Arc::clone(&order),
        });

        let f = fixture(registry, Arc::new(MockGateway::new())).await;
        let plan = PlanBuilder::new("research X then summarize")
            .step("research", "Research X", StepKind::Research)
            .with_tool("probe", serde_json::Value::Null)
            .step("synthesis", "Summarize X", StepKind::Synthesis)
            .with_tool("writeup", serde_json::Value::Null)
            .depends_on("synthesis", vec!["research".to_string()])
            .build()
            .unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(*order.lock().unwrap(), vec!["probe".to_string(), "writeup".to_string()]);
    }

    #[tokio::test]
    async fn test_always_failing_step_still_reaches_terminal_state() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(AlwaysTimeoutTool { calls: Arc::clone(&calls) });

        let f = fixture(registry, Arc::new(MockGateway::new())).await;
        let plan = PlanBuilder::new("doomed")
            .step("doomed", "This one always times out", StepKind::Research)
            .with_tool("flaky", serde_json::Value::Null)
            .with_retries(2)
            .step("after", "Depends on the doomed step", StepKind::Synthesis)
            .depends_on("after", vec!["doomed".to_string()])
            .build()
            .unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();

        // Timeout 链：BackoffRetry 在预算内重试；预算耗尽后 Decompose 也拿不到分解 -> 永久失败
        let doomed = outcome.plan.step("doomed").unwrap();
        assert_eq!(doomed.status, StepStatus::Failed);
        assert!(doomed.retry_count <= doomed.max_retries);
        // 下游被降级跳过，整体仍到达终态并产出非空汇总
        assert_eq!(outcome.plan.step("after").unwrap().status, StepStatus::Skipped);
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(!outcome.summary.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        // 两个工具互相等待对方开始：只有并发执行才能完成
        struct RendezvousTool {
            name: &'static str,
            barrier: Arc<tokio::sync::Barrier>,
        }

        #[async_trait]
        impl ToolHandler for RendezvousTool {
            fn name(&self) -> &str {
                self.name
            }

            fn description(&self) -> &str {
                "waits for its sibling"
            }

            async fn execute(
                &self,
                _params: serde_json::Value,
                _context: serde_json::Value,
            ) -> Result<serde_json::Value, String> {
                self.barrier.wait().await;
                Ok(serde_json::json!({ "done": self.name }))
            }
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut registry = ToolRegistry::new();
        registry.register(RendezvousTool {
            name: "left",
            barrier: Arc::clone(&barrier),
        });
        registry.register(RendezvousTool {
            name: "right",
            barrier: Arc::clone(&barrier),
        });

        let f = fixture(registry, Arc::new(MockGateway::new())).await;
        let plan = PlanBuilder::new("parallel")
            .step("a", "Left branch", StepKind::Research)
            .with_tool("left", serde_json::Value::Null)
            .step("b", "Right branch", StepKind::Research)
            .with_tool("right", serde_json::Value::Null)
            .build()
            .unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.plan.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(outcome.plan.step("b").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_finishes_wave_then_stops() {
        struct CancellingTool {
            token: CancellationToken,
        }

        #[async_trait]
        impl ToolHandler for CancellingTool {
            fn name(&self) -> &str {
                "first"
            }

            fn description(&self) -> &str {
                "cancels the session from inside the wave"
            }

            async fn execute(
                &self,
                _params: serde_json::Value,
                _context: serde_json::Value,
            ) -> Result<serde_json::Value, String> {
                self.token.cancel();
                Ok(serde_json::json!({ "done": true }))
            }
        }

        let token = CancellationToken::new();
        let mut registry = ToolRegistry::new();
        registry.register(CancellingTool { token: token.clone() });

        let f = fixture(registry, Arc::new(MockGateway::new())).await;
        let plan = PlanBuilder::new("cancelled mid-run")
            .step("first", "Triggers cancellation", StepKind::Research)
            .with_tool("first", serde_json::Value::Null)
            .step("second", "Never scheduled", StepKind::Synthesis)
            .depends_on("second", vec!["first".to_string()])
            .build()
            .unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, token)
            .await
            .unwrap();

        // 在途步骤跑完，新波不再启动
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.plan.step("first").unwrap().status, StepStatus::Completed);
        assert_eq!(outcome.plan.step("second").unwrap().status, StepStatus::Pending);
        let session = f.state.get(&f.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_checkpoint_created_on_flagged_step() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry.register(RecordingTool {
            name: "probe",
            order,
        });

        let f = fixture(registry, Arc::new(MockGateway::new())).await;
        let plan = PlanBuilder::new("checkpointed")
            .step("research", "Find facts", StepKind::Research)
            .with_tool("probe", serde_json::Value::Null)
            .with_checkpoint()
            .build()
            .unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);

        let session = f.state.get(&f.session_id).await.unwrap();
        assert_eq!(session.checkpoints.len(), 1);
        assert_eq!(session.checkpoints[0].label, "research");
        assert!(session.checkpoints[0].step_results.contains_key("research"));
    }

    #[tokio::test]
    async fn test_reflection_skip_marks_step_skipped() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry.register(RecordingTool {
            name: "probe",
            order,
        });

        // 队列：反思回复 skip；随后的终局反思与汇总吃默认回复
        let gateway = Arc::new(MockGateway::with_responses(vec![serde_json::json!({
            "action": "skip",
            "rationale": "result not needed",
            "confidence": 0.9
        })
        .to_string()]));

        let f = fixture(registry, gateway).await;
        let mut plan = PlanBuilder::new("reflective")
            .step("research", "Find facts", StepKind::Research)
            .with_tool("probe", serde_json::Value::Null)
            .with_reflection()
            .build()
            .unwrap();
        plan.validate().unwrap();

        let outcome = f
            .exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.plan.step("research").unwrap().status, StepStatus::Skipped);
        assert_eq!(outcome.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_revision_budget_exhaustion_aborts_with_summary() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry.register(RecordingTool {
            name: "probe",
            order,
        });

        // 反思要求修订，但修订预算为 0：立即以 Aborted 收束
        let gateway = Arc::new(MockGateway::with_responses(vec![serde_json::json!({
            "action": "revise_plan",
            "rationale": "plan is wrong",
            "confidence": 0.9,
            "restart_from_step": "research"
        })
        .to_string()]));

        let f = fixture(registry, gateway).await;
        let exec_loop = ExecutionLoop::new(
            f.exec_loop.gateway.clone(),
            f.exec_loop.tools.clone(),
            f.exec_loop.recovery.clone(),
            Arc::clone(&f.state),
            f.exec_loop.events.clone(),
            LoopConfig {
                max_parallel_steps: 2,
                max_plan_revisions: 0,
            },
        );

        let plan = PlanBuilder::new("revision-hungry")
            .step("research", "Find facts", StepKind::Research)
            .with_tool("probe", serde_json::Value::Null)
            .with_reflection()
            .build()
            .unwrap();

        let outcome = exec_loop
            .run(&f.session_id, plan, &f.planner, &f.reflection, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, SessionStatus::Aborted);
        assert!(!outcome.summary.is_empty());
        let session = f.state.get(&f.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_decomposition_splice_rewires_dependents() {
        let mut plan = PlanBuilder::new("obj")
            .step("big", "Big slow step", StepKind::Analysis)
            .step("after", "Consumer", StepKind::Synthesis)
            .depends_on("after", vec!["big".to_string()])
            .build()
            .unwrap();

        splice_decomposition(
            &mut plan,
            "big",
            &[
                serde_json::json!({"description": "first half"}),
                serde_json::json!({"description": "second half"}),
            ],
        );

        assert!(plan.step("big").is_none());
        assert!(plan.step("big_part1").is_some());
        let part2 = plan.step("big_part2").unwrap();
        assert!(part2.dependencies.contains("big_part1"));
        let after = plan.step("after").unwrap();
        assert!(after.dependencies.contains("big_part2"));
        assert!(!after.dependencies.contains("big"));
    }
}
