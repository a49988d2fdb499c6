//! 执行层：规划、主循环、反思、事件

pub mod events;
pub mod loop_;
pub mod planner;
pub mod reflection;

pub use events::{EventBus, EventKind, OrchestratorEvent};
pub use loop_::{ExecutionLoop, LoopConfig, RunOutcome, StepResult};
pub use planner::TaskPlanner;
pub use reflection::{ReflectionAction, ReflectionDecision, ReflectionGate};
