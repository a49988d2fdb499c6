//! 工具注册表
//!
//! 所有工具处理器实现 ToolHandler trait（name / description / execute），由 ToolRegistry
//! 按名注册与查找；execute 的返回值是不透明 JSON，核心不假设其内部结构。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 工具处理器 trait：名称、描述、异步执行（params / context 均为 JSON）
///
/// 处理器可返回 Err（自由文本错误信息），由执行循环转 ErrorRecord 后走恢复路径。
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// 工具名称（Step.tool_name 绑定用）
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str;

    /// 执行工具；context 包含会话上下文与上游依赖结果
    async fn execute(&self, params: Value, context: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn ToolHandler>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl ToolHandler + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, params: Value, context: Value) -> Result<Value, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(params, context).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表，用于拼入规划 prompt 的可用工具段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }
}
