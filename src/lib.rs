//! Hive - Rust 目标编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、会话状态、检查点、错误分类与恢复、取消监管
//! - **exec**: 任务规划器、执行主循环、反思闸门、编排事件
//! - **gateway**: 推理网关抽象与实现（OpenAI 兼容 / Mock）
//! - **plan**: 计划与步骤数据模型、依赖图、构建器
//! - **router**: 工作者注册表、能力评分路由、Swarm 协同
//! - **tools**: 工具处理器注册表与执行器（超时 + 审计日志）

pub mod config;
pub mod core;
pub mod exec;
pub mod gateway;
pub mod observability;
pub mod plan;
pub mod router;
pub mod tools;
