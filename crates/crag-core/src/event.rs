use tokio::sync::broadcast::{self, error::RecvError};

use crate::types::{RunId, WorkflowEvent};

/// Broadcasts workflow progress. Every subscriber sees every event;
/// publishing with no subscribers is a no-op.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Follow the next run to start, ending after its final event.
    pub fn follow_next_run(&self) -> RunFeed {
        RunFeed {
            rx: self.tx.subscribe(),
            run_id: None,
            done: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Events of a single run, in publish order.
pub struct RunFeed {
    rx: broadcast::Receiver<WorkflowEvent>,
    run_id: Option<RunId>,
    done: bool,
}

impl RunFeed {
    /// Next event of the followed run, or `None` once it finished or the
    /// bus was dropped. Events lost to lag are skipped.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        if self.done {
            return None;
        }
        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            };
            match &self.run_id {
                None if matches!(event, WorkflowEvent::RunStarted { .. }) => {
                    self.run_id = Some(event.run_id().clone());
                }
                Some(id) if id == event.run_id() => {}
                _ => continue,
            }
            self.done = event.is_final();
            return Some(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> WorkflowEvent {
        WorkflowEvent::RunStarted {
            run_id: RunId::from_str(id),
            question: "q".into(),
        }
    }

    fn completed(id: &str) -> WorkflowEvent {
        WorkflowEvent::RunComplete {
            run_id: RunId::from_str(id),
            verified: true,
            transitions: 7,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(started("r1"));
        assert_eq!(rx.recv().await.unwrap().run_id().0, "r1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::RunError {
            run_id: RunId::new(),
            error: "boom".into(),
        });
    }

    #[tokio::test]
    async fn test_feed_follows_one_run_to_completion() {
        let bus = EventBus::default();
        let mut feed = bus.follow_next_run();

        bus.publish(completed("stale"));
        bus.publish(started("r1"));
        bus.publish(started("r2"));
        bus.publish(WorkflowEvent::RunError {
            run_id: RunId::from_str("r2"),
            error: "other run".into(),
        });
        bus.publish(completed("r1"));
        bus.publish(started("r3"));

        assert!(matches!(feed.next().await, Some(WorkflowEvent::RunStarted { .. })));
        let last = feed.next().await.unwrap();
        assert!(last.is_final());
        assert_eq!(last.run_id().0, "r1");
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_feed_ends_when_bus_dropped() {
        let bus = EventBus::default();
        let mut feed = bus.follow_next_run();
        drop(bus);
        assert!(feed.next().await.is_none());
    }
}
