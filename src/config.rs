//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub router: RouterSection,
}

/// [app] 段：应用名与会话清理
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 终态会话的保留时长（秒），cleanup_expired 依据此值
    pub session_max_age_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            session_max_age_secs: 3600,
        }
    }
}

/// [llm] 段：推理网关后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；无 API Key 时自动落到 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次网关请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// [executor] 段：并发、超时与预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 同波并发上限（fan-out）
    pub max_parallel_steps: usize,
    /// 单步工具调用超时（秒）
    pub step_timeout_secs: u64,
    /// 计划修订预算
    pub max_plan_revisions: u32,
    /// 步骤默认最大重试次数（网关未指定时）
    pub default_max_retries: u32,
    /// 喂给反思的结果预览上限（字符）
    pub result_preview_chars: usize,
    /// 事件总线容量
    pub event_capacity: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            step_timeout_secs: 60,
            max_plan_revisions: 3,
            default_max_retries: 2,
            result_preview_chars: 2000,
            event_capacity: 64,
        }
    }
}

/// [recovery] 段：退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 一个退避时间单位（毫秒）；生产 1000ms，测试可压到 1ms
    pub backoff_base_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { backoff_base_ms: 1000 }
    }
}

/// [router] 段：Swarm 规模与回退深度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Swarm 最多同时出场的工作者数（硬上限 5）
    pub max_swarm_workers: usize,
    /// single 模式失败后的回退工作者数
    pub max_fallbacks: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_swarm_workers: 5,
            max_fallbacks: 3,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
