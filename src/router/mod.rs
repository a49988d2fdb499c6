//! 路由层：工作者注册、能力评分路由、Swarm 协同

pub mod router;
pub mod swarm;
pub mod worker;

pub use router::{AgentRouter, ExecutionMode, RouteRequest, RoutingDecision};
pub use swarm::SwarmCoordinator;
pub use worker::{Worker, WorkerId, WorkerProfile, WorkerRegistry, WorkerStats, WorkerTask};
