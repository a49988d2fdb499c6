//! 网关响应 schema
//!
//! 每个调用点一种严格的响应类型（计划 / 反思 / 分解 / 汇总 / 任务分析），
//! 统一经 extract_json 容错提取（```json 围栏或最外层大括号），
//! 解析失败返回 MalformedResponse，由调用点降级，绝不 panic。

use serde::Deserialize;

use crate::gateway::traits::GatewayError;

/// 从自由文本中提取 JSON 块：优先 ```json 围栏，其次最外层 { .. }
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = match rest.find("```") {
            Some(end) => &rest[..end],
            None => rest,
        };
        return Some(body.trim());
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

fn parse_as<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, GatewayError> {
    let json = extract_json(raw)
        .ok_or_else(|| GatewayError::MalformedResponse(preview(raw)))?;
    serde_json::from_str(json).map_err(|e| GatewayError::MalformedResponse(format!("{}: {}", e, preview(json))))
}

fn preview(raw: &str) -> String {
    let p: String = raw.chars().take(160).collect();
    if raw.len() > 160 {
        format!("{}...", p)
    } else {
        p
    }
}

/// 任务分析响应（规划第一阶段）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalysisResponse {
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// 计划响应
#[derive(Debug, Clone, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub objective: Option<String>,
    pub steps: Vec<PlannedStep>,
}

/// 网关返回的单个步骤；除 description 外均可缺省，由规划器补默认值
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedStep {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_params: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub requires_reflection: Option<bool>,
    #[serde(default)]
    pub checkpoint: Option<bool>,
}

/// 反思响应
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionResponse {
    pub action: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub restart_from_step: Option<String>,
}

/// 分解响应（失败步骤拆分 / Swarm 角色子任务）
#[derive(Debug, Clone, Deserialize)]
pub struct DecompositionResponse {
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subtask {
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    /// Swarm 模式下的角色标签（对应工作者能力）
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// 汇总响应
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisResponse {
    pub text: String,
}

pub fn parse_analysis(raw: &str) -> Result<AnalysisResponse, GatewayError> {
    parse_as(raw)
}

pub fn parse_plan(raw: &str) -> Result<PlanResponse, GatewayError> {
    parse_as(raw)
}

pub fn parse_reflection(raw: &str) -> Result<ReflectionResponse, GatewayError> {
    parse_as(raw)
}

pub fn parse_decomposition(raw: &str) -> Result<DecompositionResponse, GatewayError> {
    parse_as(raw)
}

pub fn parse_synthesis(raw: &str) -> Result<SynthesisResponse, GatewayError> {
    parse_as(raw)
}
