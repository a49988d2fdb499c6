//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；分波结果供并发调度与环检测共用。

use std::collections::HashMap;

use crate::plan::types::{PlanError, Step, StepId};

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的下游步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    pub fn new(steps: &[Step]) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            adjacency.entry(step.id.clone()).or_default();
            in_degree.entry(step.id.clone()).or_insert(0);
        }

        for step in steps {
            for dep in &step.dependencies {
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self { adjacency, in_degree }
    }

    /// 直接依赖 `step_id` 的下游步骤
    pub fn dependents_of(&self, step_id: &str) -> &[StepId] {
        self.adjacency
            .get(step_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Kahn 拓扑排序，按波（同波内可并发）返回；存在环时报 CyclicDependency。
    ///
    /// 波内按 ID 排序，保证结果确定性。
    pub fn topological_waves(&self) -> Result<Vec<Vec<StepId>>, PlanError> {
        let mut in_degree = self.in_degree.clone();
        let mut waves: Vec<Vec<StepId>> = Vec::new();
        let mut placed = 0usize;

        loop {
            let mut wave: Vec<StepId> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(id, _)| id.clone())
                .collect();
            if wave.is_empty() {
                break;
            }
            wave.sort();

            for id in &wave {
                in_degree.remove(id);
                for dependent in self.dependents_of(id) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }

            placed += wave.len();
            waves.push(wave);
        }

        if placed != self.in_degree.len() {
            return Err(PlanError::CyclicDependency);
        }
        Ok(waves)
    }
}
