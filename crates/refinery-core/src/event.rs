use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{self, Receiver};

use crate::status::ExecutionStatus;
use crate::types::WorkflowEvent;

/// Broadcast bus for queue and execution lifecycle events.
/// All subscribers receive all events.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Subscribe to the events of a single execution.
    pub fn subscribe_execution(&self, execution_id: &str) -> ExecutionEvents {
        ExecutionEvents {
            rx: self.tx.subscribe(),
            execution_id: execution_id.to_string(),
            lagged: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver that only yields events for one execution.
pub struct ExecutionEvents {
    rx: Receiver<WorkflowEvent>,
    execution_id: String,
    lagged: bool,
}

impl ExecutionEvents {
    /// Next event for this execution, `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => self.lagged = true,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the execution's terminal event and return its status.
    pub async fn finished(&mut self) -> Option<ExecutionStatus> {
        while let Some(event) = self.recv().await {
            if let WorkflowEvent::ExecutionFinished { status, .. } = event {
                return Some(status);
            }
        }
        None
    }

    /// Whether events were dropped because this receiver fell behind. A
    /// lagged receiver may have missed the terminal event.
    pub fn lagged(&self) -> bool {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    #[tokio::test]
    async fn test_all_subscribers_receive() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: "e1".into(),
        });
        assert_eq!(a.recv().await.unwrap().execution_id(), "e1");
        assert_eq!(b.recv().await.unwrap().execution_id(), "e1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: "e1".into(),
        });
    }

    #[tokio::test]
    async fn test_execution_subscription_filters_other_executions() {
        let bus = EventBus::default();
        let mut events = bus.subscribe_execution("e1");

        bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: "e2".into(),
            status: ExecutionStatus::Failed,
        });
        bus.publish(WorkflowEvent::JobCompleted {
            job_id: JobId::for_step("e1", "a"),
            result: serde_json::Value::Null,
        });
        bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: "e1".into(),
            status: ExecutionStatus::Completed,
        });

        assert_eq!(events.finished().await, Some(ExecutionStatus::Completed));
        assert!(!events.lagged());
    }

    #[tokio::test]
    async fn test_execution_subscription_reports_lag() {
        let bus = EventBus::new(1);
        let mut events = bus.subscribe_execution("e1");
        for _ in 0..3 {
            bus.publish(WorkflowEvent::ExecutionStarted {
                execution_id: "e1".into(),
            });
        }
        assert!(events.recv().await.is_some());
        assert!(events.lagged());
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::default();
        let mut events = bus.subscribe_execution("e1");
        drop(bus);
        assert_eq!(events.finished().await, None);
    }
}
