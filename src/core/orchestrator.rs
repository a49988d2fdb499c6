//! 编排器：依赖注入根与会话控制 API
//!
//! Orchestrator 在构造时拿到推理网关、工具执行器、状态管理器、恢复管理器与可选路由器
//! （无模块级单例），对外暴露 create_session / run_session / cancel / status / subscribe。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::core::error::OrchestratorError;
use crate::core::recovery::RecoveryManager;
use crate::core::state::{
    InMemoryCheckpointStore, SessionId, SessionStatus, SessionSummary, StateManager,
};
use crate::core::supervisor::SessionSupervisor;
use crate::exec::events::{EventBus, EventKind, OrchestratorEvent};
use crate::exec::loop_::{ExecutionLoop, LoopConfig, RunOutcome};
use crate::exec::planner::TaskPlanner;
use crate::exec::reflection::ReflectionGate;
use crate::gateway::{MockGateway, OpenAiGateway, ReasoningGateway};
use crate::router::AgentRouter;
use crate::tools::{ToolExecutor, ToolRegistry};

/// 根据配置与环境变量选择推理网关后端（OpenAI 兼容 / Mock）
pub fn create_gateway_from_config(cfg: &AppConfig) -> Arc<dyn ReasoningGateway> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "openai" && has_key {
        tracing::info!("Using OpenAI-compatible gateway ({})", cfg.llm.model);
        Arc::new(OpenAiGateway::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
            cfg.llm.request_timeout_secs,
        ))
    } else {
        if provider != "mock" {
            tracing::warn!("No API key set or provider unknown, using mock gateway");
        }
        Arc::new(MockGateway::new())
    }
}

/// 一次会话运行的对外结果
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub summary: String,
}

/// 编排器构建器：除网关外其余协作方都有默认实现
pub struct OrchestratorBuilder {
    gateway: Arc<dyn ReasoningGateway>,
    config: AppConfig,
    tools: ToolRegistry,
    state: Option<Arc<StateManager>>,
    router: Option<Arc<AgentRouter>>,
}

impl OrchestratorBuilder {
    pub fn new(gateway: Arc<dyn ReasoningGateway>) -> Self {
        Self {
            gateway,
            config: AppConfig::default(),
            tools: ToolRegistry::new(),
            state: None,
            router: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// 换掉默认的内存状态管理器（如注入自定义 CheckpointStore 的实例）
    pub fn with_state_manager(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_router(mut self, router: Arc<AgentRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> Orchestrator {
        let cfg = self.config;
        let state = self
            .state
            .unwrap_or_else(|| Arc::new(StateManager::new(Arc::new(InMemoryCheckpointStore::default()))));
        let events = EventBus::new(cfg.executor.event_capacity);
        let tools = Arc::new(ToolExecutor::new(self.tools, cfg.executor.step_timeout_secs));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&self.gateway),
            cfg.recovery.backoff_base_ms,
        ));
        let planner = TaskPlanner::new(Arc::clone(&self.gateway), cfg.executor.default_max_retries);
        let reflection = ReflectionGate::new(Arc::clone(&self.gateway), cfg.executor.result_preview_chars);

        Orchestrator {
            gateway: self.gateway,
            tools,
            state,
            recovery,
            router: self.router,
            events,
            supervisor: SessionSupervisor::new(),
            planner,
            reflection,
            config: cfg,
        }
    }
}

/// 编排器
pub struct Orchestrator {
    gateway: Arc<dyn ReasoningGateway>,
    tools: Arc<ToolExecutor>,
    state: Arc<StateManager>,
    recovery: Arc<RecoveryManager>,
    router: Option<Arc<AgentRouter>>,
    events: EventBus,
    supervisor: SessionSupervisor,
    planner: TaskPlanner,
    reflection: ReflectionGate,
    config: AppConfig,
}

impl Orchestrator {
    pub fn builder(gateway: Arc<dyn ReasoningGateway>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(gateway)
    }

    /// 订阅编排事件流（传输层唯一出口）
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn router(&self) -> Option<Arc<AgentRouter>> {
        self.router.clone()
    }

    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// 网关累计 token 统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.gateway.token_usage()
    }

    /// 创建会话，返回 session_id
    pub async fn create_session(&self, objective: &str) -> SessionId {
        let session_id = self.state.create_session(objective).await;
        // 预创建取消令牌，create 后立即 cancel 也能生效
        let _ = self.supervisor.token_for(&session_id).await;
        session_id
    }

    /// 规划并驱动会话到终态
    pub async fn run_session(&self, session_id: &str) -> Result<SessionOutcome, OrchestratorError> {
        let session = self
            .state
            .get(session_id)
            .await
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        let objective = session.objective.clone();
        let cancel = self.supervisor.token_for(session_id).await;

        self.state.set_status(session_id, SessionStatus::Planning).await?;
        let context = serde_json::json!({
            "available_tools": self.tools.tool_descriptions(),
        });
        let plan = self.planner.create_plan(&objective, context).await;

        let exec_loop = ExecutionLoop::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.tools),
            Arc::clone(&self.recovery),
            Arc::clone(&self.state),
            self.events.clone(),
            LoopConfig {
                max_parallel_steps: self.config.executor.max_parallel_steps,
                max_plan_revisions: self.config.executor.max_plan_revisions,
            },
        );

        let result = exec_loop
            .run(session_id, plan, &self.planner, &self.reflection, cancel)
            .await;
        self.supervisor.remove(session_id).await;

        match result {
            Ok(RunOutcome { status, summary, .. }) => Ok(SessionOutcome {
                session_id: session_id.to_string(),
                status,
                summary,
            }),
            Err(e) => {
                // 死锁等致命路径：状态已置 Failed，这里仍给调用方一句可读的收尾
                let summary = format!("Execution failed: {}", e);
                self.state
                    .add_message(session_id, "assistant", summary.clone())
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    /// create + run 一步到位
    pub async fn execute(&self, objective: &str) -> Result<SessionOutcome, OrchestratorError> {
        let session_id = self.create_session(objective).await;
        self.run_session(&session_id).await
    }

    /// 协作式取消：当前波跑完后生效
    pub async fn cancel(&self, session_id: &str) {
        self.supervisor.cancel(session_id).await;
    }

    /// 会话状态摘要
    pub async fn status(&self, session_id: &str) -> Option<SessionSummary> {
        self.state.summary(session_id).await
    }

    /// 清理超龄的终态会话
    pub async fn cleanup_expired(&self) -> usize {
        self.state
            .cleanup_expired(Duration::from_secs(self.config.app.session_max_age_secs))
            .await
    }

    /// 发布一条执行错误事件（供外层 run 失败时通知订阅者）
    pub fn publish_error(&self, session_id: &str, error: &OrchestratorError) {
        self.events.publish(EventKind::ExecutionError {
            session_id: session_id.to_string(),
            error: error.to_string(),
        });
    }
}
