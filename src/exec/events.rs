//! 编排事件：执行过程的唯一对外出口（供 SSE / WebSocket 等传输层消费）
//!
//! 单步生命周期内 started 先于 completed/failed；同波内独立步骤之间不保证顺序。

use serde::Serialize;
use tokio::sync::broadcast;

/// 编排事件（可序列化为 {type, data, timestamp} JSON）
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorEvent {
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// 事件类别
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    #[serde(rename = "plan.created")]
    PlanCreated {
        plan_id: String,
        objective: String,
        steps: usize,
    },
    #[serde(rename = "plan.revised")]
    PlanRevised {
        plan_id: String,
        revision: u32,
    },
    #[serde(rename = "step.started")]
    StepStarted {
        step_id: String,
        description: String,
    },
    #[serde(rename = "step.completed")]
    StepCompleted { step_id: String },
    #[serde(rename = "step.failed")]
    StepFailed {
        step_id: String,
        error: String,
    },
    #[serde(rename = "step.retry")]
    StepRetry {
        step_id: String,
        attempt: u32,
    },
    #[serde(rename = "reflection.result")]
    ReflectionResult {
        step_id: String,
        action: String,
        confidence: f64,
    },
    #[serde(rename = "checkpoint.created")]
    CheckpointCreated { label: String },
    #[serde(rename = "execution.completed")]
    ExecutionCompleted { session_id: String },
    #[serde(rename = "execution.aborted")]
    ExecutionAborted {
        session_id: String,
        reason: String,
    },
    #[serde(rename = "execution.error")]
    ExecutionError {
        session_id: String,
        error: String,
    },
}

/// 事件总线：broadcast 扇出，零或多个订阅者；发布方永不因无订阅者而失败
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind) {
        let event = OrchestratorEvent {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
        };
        // 无订阅者时 send 返回 Err，属正常情况
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_serializes_with_dotted_type() {
        let event = OrchestratorEvent {
            timestamp: 1,
            kind: EventKind::StepStarted {
                step_id: "a".into(),
                description: "do a".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step.started");
        assert_eq!(json["data"]["step_id"], "a");
        assert_eq!(json["timestamp"], 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(EventKind::ExecutionCompleted {
            session_id: "s".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EventKind::StepStarted {
            step_id: "a".into(),
            description: String::new(),
        });
        bus.publish(EventKind::StepCompleted { step_id: "a".into() });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::StepStarted { .. }));
        assert!(matches!(second.kind, EventKind::StepCompleted { .. }));
    }
}
