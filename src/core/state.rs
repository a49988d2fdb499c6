//! 会话状态与检查点
//!
//! SessionState 由 StateManager 独占持有：执行循环只通过 API 追加，从不直接改字段。
//! 检查点是不可变快照（创建时深拷贝），恢复是对三个可变字段的纯覆盖而非合并。
//! 检查点持久化落在可插拔的 CheckpointStore 后面（默认内存实现）。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::error::OrchestratorError;
use crate::plan::types::{PlanId, StepId};

pub type SessionId = String;

/// 会话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Planning,
    Running,
    Completed,
    Aborted,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted | Self::Failed | Self::Cancelled
        )
    }
}

/// 会话内消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 会话产物（汇总文本、生成文件引用等）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: String,
    pub data: serde_json::Value,
    pub created_at: i64,
}

/// 不可变状态快照；追加后不再编辑
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    pub timestamp: i64,
    pub current_step: Option<StepId>,
    pub step_results: HashMap<StepId, serde_json::Value>,
    pub context: HashMap<String, serde_json::Value>,
}

/// 会话全量状态
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// 执行模式（single / swarm 等，路由层写入）
    pub mode: String,
    pub objective: String,
    pub plan_id: Option<PlanId>,
    pub current_step: Option<StepId>,
    pub step_results: HashMap<StepId, serde_json::Value>,
    pub context: HashMap<String, serde_json::Value>,
    pub messages: Vec<Message>,
    pub artifacts: Vec<Artifact>,
    pub checkpoints: Vec<Checkpoint>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 供调用方展示的轻量投影
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub objective: String,
    pub plan_id: Option<PlanId>,
    pub current_step: Option<StepId>,
    pub completed_results: usize,
    pub checkpoints: usize,
    pub updated_at: i64,
}

/// 检查点持久化接口：默认内存实现；生产可换持久化后端，核心不感知路径细节
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn append(&self, session_id: &str, checkpoint: Checkpoint);
    async fn list(&self, session_id: &str) -> Vec<Checkpoint>;
    async fn clear(&self, session_id: &str);
}

/// 内存检查点存储
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, session_id: &str, checkpoint: Checkpoint) {
        self.inner
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(checkpoint);
    }

    async fn list(&self, session_id: &str) -> Vec<Checkpoint> {
        self.inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn clear(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }
}

/// 会话状态管理器：create / update / checkpoint / restore / cleanup
pub struct StateManager {
    sessions: RwLock<HashMap<SessionId, SessionState>>,
    store: std::sync::Arc<dyn CheckpointStore>,
}

impl StateManager {
    pub fn new(store: std::sync::Arc<dyn CheckpointStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub async fn create_session(&self, objective: impl Into<String>) -> SessionId {
        let now = chrono::Utc::now().timestamp_millis();
        let session_id = format!("session_{}", uuid::Uuid::new_v4());
        let state = SessionState {
            session_id: session_id.clone(),
            status: SessionStatus::Created,
            mode: "single".to_string(),
            objective: objective.into(),
            plan_id: None,
            current_step: None,
            step_results: HashMap::new(),
            context: HashMap::new(),
            messages: Vec::new(),
            artifacts: Vec::new(),
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.sessions.write().await.insert(session_id.clone(), state);
        session_id
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.sessions.read().await.get(session_id).map(|s| SessionSummary {
            session_id: s.session_id.clone(),
            status: s.status,
            objective: s.objective.clone(),
            plan_id: s.plan_id.clone(),
            current_step: s.current_step.clone(),
            completed_results: s.step_results.len(),
            checkpoints: s.checkpoints.len(),
            updated_at: s.updated_at,
        })
    }

    async fn with_session<F>(&self, session_id: &str, mutate: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut SessionState),
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        mutate(session);
        session.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), OrchestratorError> {
        self.with_session(session_id, |s| s.status = status).await
    }

    pub async fn set_mode(&self, session_id: &str, mode: impl Into<String>) -> Result<(), OrchestratorError> {
        let mode = mode.into();
        self.with_session(session_id, |s| s.mode = mode).await
    }

    pub async fn set_plan(&self, session_id: &str, plan_id: PlanId) -> Result<(), OrchestratorError> {
        self.with_session(session_id, |s| s.plan_id = Some(plan_id)).await
    }

    pub async fn set_current_step(&self, session_id: &str, step_id: Option<StepId>) -> Result<(), OrchestratorError> {
        self.with_session(session_id, |s| s.current_step = step_id).await
    }

    /// 记录步骤结果；并发步骤各写各的 step_id 键，互不覆盖
    pub async fn add_step_result(
        &self,
        session_id: &str,
        step_id: StepId,
        result: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.with_session(session_id, |s| {
            s.step_results.insert(step_id, result);
        })
        .await
    }

    pub async fn set_context_value(
        &self,
        session_id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let key = key.into();
        self.with_session(session_id, |s| {
            s.context.insert(key, value);
        })
        .await
    }

    pub async fn add_message(
        &self,
        session_id: &str,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let message = Message::new(role, content);
        self.with_session(session_id, |s| s.messages.push(message)).await
    }

    pub async fn add_artifact(
        &self,
        session_id: &str,
        name: impl Into<String>,
        kind: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let artifact = Artifact {
            name: name.into(),
            kind: kind.into(),
            data,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.with_session(session_id, |s| s.artifacts.push(artifact)).await
    }

    /// 创建检查点：深拷贝当前 step_results / context，追加到会话并镜像到存储
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        label: impl Into<String>,
    ) -> Result<Checkpoint, OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;

        let checkpoint = Checkpoint {
            label: label.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            current_step: session.current_step.clone(),
            step_results: session.step_results.clone(),
            context: session.context.clone(),
        };
        session.checkpoints.push(checkpoint.clone());
        session.updated_at = checkpoint.timestamp;
        drop(sessions);

        self.store.append(session_id, checkpoint.clone()).await;
        Ok(checkpoint)
    }

    /// 恢复检查点：index 支持负值（-1 为最新）；纯覆盖 step_results / context / current_step
    pub async fn restore_checkpoint(&self, session_id: &str, index: isize) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };

        let len = session.checkpoints.len() as isize;
        let resolved = if index < 0 { len + index } else { index };
        if resolved < 0 || resolved >= len {
            return false;
        }

        let checkpoint = session.checkpoints[resolved as usize].clone();
        session.step_results = checkpoint.step_results;
        session.context = checkpoint.context;
        session.current_step = checkpoint.current_step;
        session.updated_at = chrono::Utc::now().timestamp_millis();
        true
    }

    /// 清理超龄的终态会话，返回清理数量
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.status.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);

        for id in &expired {
            self.store.clear(id).await;
        }
        expired.len()
    }
}
