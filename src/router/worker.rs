//! 工作者注册表
//!
//! 工作者（外部执行体）按 ID 注册，声明能力、优先级与并发上限；
//! 注册表负责负载计数与历史统计（成功率 / 平均延迟的指数加权），供路由评分使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

pub type WorkerId = String;

/// 统计的指数加权系数
const EMA_ALPHA: f64 = 0.3;

/// 工作者静态画像
#[derive(Debug, Clone, Serialize)]
pub struct WorkerProfile {
    pub id: WorkerId,
    /// 能力标签（路由按标签匹配）
    pub capabilities: Vec<String>,
    /// 0 为最高优先级，越大越低
    pub priority: u8,
    /// 并发上限；达到上限的工作者不进入候选
    pub concurrent_limit: u32,
}

impl WorkerProfile {
    pub fn new(id: impl Into<WorkerId>, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            priority: 5,
            concurrent_limit: 3,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrent_limit(mut self, limit: u32) -> Self {
        self.concurrent_limit = limit.max(1);
        self
    }

    pub fn can_handle(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// 分派给工作者的任务
#[derive(Debug, Clone, Serialize)]
pub struct WorkerTask {
    pub request_id: String,
    pub description: String,
    /// Swarm 模式下的角色标签
    pub role: Option<String>,
    pub params: serde_json::Value,
    pub context: serde_json::Value,
}

/// 工作者 trait：外部执行体，核心只消费
#[async_trait]
pub trait Worker: Send + Sync {
    fn profile(&self) -> WorkerProfile;

    async fn run(&self, task: &WorkerTask) -> Result<serde_json::Value, String>;
}

/// 运行时统计
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub current_load: u32,
    pub total_runs: u64,
    /// [0, 1]，指数加权
    pub success_rate: f64,
    /// 毫秒，指数加权
    pub avg_latency_ms: f64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            current_load: 0,
            total_runs: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
        }
    }
}

struct Registered {
    worker: Arc<dyn Worker>,
    profile: WorkerProfile,
    stats: WorkerStats,
}

/// 候选快照（评分输入）
#[derive(Debug, Clone)]
pub struct Candidate {
    pub profile: WorkerProfile,
    pub stats: WorkerStats,
}

/// 工作者注册表
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Registered>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, worker: Arc<dyn Worker>) {
        let profile = worker.profile();
        self.workers.write().await.insert(
            profile.id.clone(),
            Registered {
                worker,
                profile,
                stats: WorkerStats::default(),
            },
        );
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.read().await.get(id).map(|r| Arc::clone(&r.worker))
    }

    pub async fn stats(&self, id: &str) -> Option<WorkerStats> {
        self.workers.read().await.get(id).map(|r| r.stats.clone())
    }

    /// 满足能力要求且未达并发上限的候选
    pub async fn candidates(&self, required: &[String]) -> Vec<Candidate> {
        self.workers
            .read()
            .await
            .values()
            .filter(|r| r.profile.can_handle(required) && r.stats.current_load < r.profile.concurrent_limit)
            .map(|r| Candidate {
                profile: r.profile.clone(),
                stats: r.stats.clone(),
            })
            .collect()
    }

    pub async fn begin_dispatch(&self, id: &str) {
        if let Some(r) = self.workers.write().await.get_mut(id) {
            r.stats.current_load += 1;
        }
    }

    pub async fn finish_dispatch(&self, id: &str, ok: bool, latency_ms: u64) {
        if let Some(r) = self.workers.write().await.get_mut(id) {
            r.stats.current_load = r.stats.current_load.saturating_sub(1);
            r.stats.total_runs += 1;
            let outcome = if ok { 1.0 } else { 0.0 };
            r.stats.success_rate = (1.0 - EMA_ALPHA) * r.stats.success_rate + EMA_ALPHA * outcome;
            r.stats.avg_latency_ms = if r.stats.total_runs == 1 {
                latency_ms as f64
            } else {
                (1.0 - EMA_ALPHA) * r.stats.avg_latency_ms + EMA_ALPHA * latency_ms as f64
            };
        }
    }
}
