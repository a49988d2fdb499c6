//! Echo 工具：原样返回输入，内置用于演示与测试

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::registry::ToolHandler;

pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given params unchanged"
    }

    async fn execute(&self, params: Value, _context: Value) -> Result<Value, String> {
        Ok(serde_json::json!({ "echo": params }))
    }
}
