//! Swarm 协同
//!
//! 请求需要多种能力同时出场时：请网关把请求分解为带角色标签与依赖的子任务，
//! 复用计划依赖图按波执行（每个子任务派给角色匹配的工作者），
//! 最后请网关把各角色产出汇总为一个结果。子任务失败记为降级结果，不拖垮整体。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use crate::core::error::OrchestratorError;
use crate::gateway::responses::{parse_decomposition, parse_synthesis, Subtask};
use crate::gateway::traits::{GatewayRequest, ReasoningGateway};
use crate::plan::graph::PlanGraph;
use crate::plan::types::{Step, StepKind};
use crate::router::router::RouteRequest;
use crate::router::worker::{WorkerId, WorkerRegistry, WorkerTask};

const SWARM_DECOMPOSE_INSTRUCTION: &str = "You split a request across specialist roles. \
Respond with JSON only: {\"subtasks\": [{\"id\": \"task_1\", \"description\": \"...\", \
\"role\": \"<one of the given roles>\", \"dependencies\": []}]}. \
Dependencies reference earlier subtask ids. At most five subtasks.";

const SWARM_SYNTH_INSTRUCTION: &str = "You combine the outputs of several specialist roles into one answer. \
Respond with JSON only: {\"text\": \"...\"}.";

/// Swarm 协调器
pub struct SwarmCoordinator {
    registry: Arc<WorkerRegistry>,
    gateway: Arc<dyn ReasoningGateway>,
}

impl SwarmCoordinator {
    pub fn new(registry: Arc<WorkerRegistry>, gateway: Arc<dyn ReasoningGateway>) -> Self {
        Self { registry, gateway }
    }

    pub async fn execute(
        &self,
        request: &RouteRequest,
        worker_ids: &[WorkerId],
    ) -> Result<serde_json::Value, OrchestratorError> {
        if worker_ids.is_empty() {
            return Err(OrchestratorError::NoWorkerAvailable("swarm with no workers".to_string()));
        }

        // 角色表：工作者 ID -> 能力标签
        let mut roles: HashMap<WorkerId, Vec<String>> = HashMap::new();
        for id in worker_ids {
            if let Some(worker) = self.registry.get(id).await {
                roles.insert(id.clone(), worker.profile().capabilities);
            }
        }

        let subtasks = self.decompose(request, &roles).await;
        let results = self.run_subtasks(request, &subtasks, &roles).await;
        let text = self.synthesize(request, &results).await;

        Ok(serde_json::json!({
            "text": text,
            "subtask_results": results,
        }))
    }

    /// 请网关做角色化分解；失败时降级为「每个角色一份整活」
    async fn decompose(
        &self,
        request: &RouteRequest,
        roles: &HashMap<WorkerId, Vec<String>>,
    ) -> Vec<Subtask> {
        let role_tags: Vec<&String> = roles.values().flatten().collect();
        let gateway_request = GatewayRequest::new(SWARM_DECOMPOSE_INSTRUCTION, &request.description)
            .with_context(serde_json::json!({ "roles": role_tags }));

        if let Ok(raw) = self.gateway.query(gateway_request).await {
            if let Ok(parsed) = parse_decomposition(&raw) {
                if !parsed.subtasks.is_empty() {
                    return parsed.subtasks.into_iter().take(5).collect();
                }
            }
        }

        tracing::warn!("swarm decomposition degraded: one subtask per worker");
        roles
            .iter()
            .take(5)
            .enumerate()
            .map(|(i, (_, caps))| Subtask {
                id: Some(format!("task_{}", i + 1)),
                description: request.description.clone(),
                role: caps.first().cloned(),
                dependencies: Vec::new(),
            })
            .collect()
    }

    /// 依赖图分波执行子任务；波内并发，按完成顺序收集
    async fn run_subtasks(
        &self,
        request: &RouteRequest,
        subtasks: &[Subtask],
        roles: &HashMap<WorkerId, Vec<String>>,
    ) -> serde_json::Value {
        // 借用 Step/PlanGraph 做拓扑：id 去悬挂后分波；带环的分解整体退化为单波
        let mut steps: Vec<Step> = Vec::with_capacity(subtasks.len());
        let mut by_id: HashMap<String, &Subtask> = HashMap::new();
        for (i, subtask) in subtasks.iter().enumerate() {
            let id = subtask
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("task_{}", i + 1));
            let mut step = Step::new(&id, &subtask.description, StepKind::Research);
            step.dependencies = subtask.dependencies.iter().cloned().collect();
            by_id.insert(id, subtask);
            steps.push(step);
        }
        let ids: BTreeSet<String> = steps.iter().map(|s| s.id.clone()).collect();
        for step in &mut steps {
            step.dependencies.retain(|dep| ids.contains(dep));
        }

        let graph = PlanGraph::new(&steps);
        let waves = graph.topological_waves().unwrap_or_else(|_| {
            tracing::warn!("swarm decomposition was cyclic, flattening to one wave");
            vec![steps.iter().map(|s| s.id.clone()).collect()]
        });

        let mut results = serde_json::Map::new();
        for wave in waves {
            let mut join_set: JoinSet<(String, serde_json::Value)> = JoinSet::new();
            for task_id in wave {
                let Some(subtask) = by_id.get(&task_id) else {
                    continue;
                };
                let role = subtask.role.clone();
                let worker_id = self.worker_for_role(role.as_deref(), roles);
                let Some(worker) = self.registry.get(&worker_id).await else {
                    continue;
                };

                let mut dependency_results = serde_json::Map::new();
                for dep in &subtask.dependencies {
                    if let Some(value) = results.get(dep) {
                        dependency_results.insert(dep.clone(), value.clone());
                    }
                }
                let task = WorkerTask {
                    request_id: request.request_id.clone(),
                    description: subtask.description.clone(),
                    role,
                    params: request.params.clone(),
                    context: serde_json::json!({ "dependencies": dependency_results }),
                };

                let registry = Arc::clone(&self.registry);
                registry.begin_dispatch(&worker_id).await;
                join_set.spawn(async move {
                    let start = Instant::now();
                    let outcome = worker.run(&task).await;
                    registry
                        .finish_dispatch(&worker_id, outcome.is_ok(), start.elapsed().as_millis() as u64)
                        .await;
                    let value = match outcome {
                        Ok(value) => serde_json::json!({ "worker": worker_id, "result": value }),
                        Err(e) => serde_json::json!({ "worker": worker_id, "error": e }),
                    };
                    (task_id, value)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                if let Ok((task_id, value)) = joined {
                    results.insert(task_id, value);
                }
            }
        }

        serde_json::Value::Object(results)
    }

    /// 角色匹配的工作者；无匹配时落到首个工作者
    fn worker_for_role(&self, role: Option<&str>, roles: &HashMap<WorkerId, Vec<String>>) -> WorkerId {
        if let Some(role) = role {
            for (id, caps) in roles {
                if caps.iter().any(|c| c == role) {
                    return id.clone();
                }
            }
        }
        roles.keys().next().cloned().unwrap_or_default()
    }

    async fn synthesize(&self, request: &RouteRequest, results: &serde_json::Value) -> String {
        let gateway_request = GatewayRequest::new(SWARM_SYNTH_INSTRUCTION, &request.description)
            .with_context(serde_json::json!({ "role_outputs": results }));
        if let Ok(raw) = self.gateway.query(gateway_request).await {
            if let Ok(parsed) = parse_synthesis(&raw) {
                if !parsed.text.trim().is_empty() {
                    return parsed.text;
                }
            }
        }
        format!("Combined {} subtask results for: {}",
            results.as_object().map(|m| m.len()).unwrap_or(0),
            request.description
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::router::worker::{Worker, WorkerProfile};
    use async_trait::async_trait;

    struct RoleWorker {
        id: &'static str,
        capability: &'static str,
    }

    #[async_trait]
    impl Worker for RoleWorker {
        fn profile(&self) -> WorkerProfile {
            WorkerProfile::new(self.id, vec![self.capability.to_string()])
        }

        async fn run(&self, task: &WorkerTask) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({
                "role": task.role,
                "by": self.id,
                "saw_dependencies": task.context["dependencies"]
                    .as_object()
                    .map(|m| m.len())
                    .unwrap_or(0),
            }))
        }
    }

    #[tokio::test]
    async fn test_swarm_respects_subtask_dependencies() {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register(Arc::new(RoleWorker { id: "scout", capability: "research" }))
            .await;
        registry
            .register(Arc::new(RoleWorker { id: "writer", capability: "synthesis" }))
            .await;

        let decomposition = serde_json::json!({
            "subtasks": [
                {"id": "gather", "description": "Collect data", "role": "research", "dependencies": []},
                {"id": "report", "description": "Write report", "role": "synthesis", "dependencies": ["gather"]}
            ]
        })
        .to_string();
        let synthesis = serde_json::json!({ "text": "swarm answer" }).to_string();
        let gateway = Arc::new(MockGateway::with_responses(vec![decomposition, synthesis]));

        let swarm = SwarmCoordinator::new(registry, gateway);
        let request = RouteRequest::new("investigate and report", vec![]);
        let value = swarm
            .execute(&request, &["scout".to_string(), "writer".to_string()])
            .await
            .unwrap();

        assert_eq!(value["text"], "swarm answer");
        let report = &value["subtask_results"]["report"];
        assert_eq!(report["result"]["by"], "writer");
        // report 在 gather 之后执行，看得到它的依赖结果
        assert_eq!(report["result"]["saw_dependencies"], 1);
    }

    #[tokio::test]
    async fn test_swarm_degrades_when_decomposition_malformed() {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register(Arc::new(RoleWorker { id: "solo", capability: "research" }))
            .await;

        let gateway = Arc::new(MockGateway::with_responses(vec![
            "no json here".to_string(),
        ]));
        let swarm = SwarmCoordinator::new(registry, gateway);
        let request = RouteRequest::new("just do it", vec![]);
        let value = swarm.execute(&request, &["solo".to_string()]).await.unwrap();

        let results = value["subtask_results"].as_object().unwrap();
        assert_eq!(results.len(), 1);
        assert!(!value["text"].as_str().unwrap().is_empty());
    }
}
