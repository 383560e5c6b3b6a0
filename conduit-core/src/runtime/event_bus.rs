use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use conduit_model::{OperationId, OperationState};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::Result,
    events::{OperationEvent, OperationEventPublisher},
    scope::Scope,
};

/// Outcome delivered to a caller waiting on one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationNotification {
    Finished(OperationState),
    /// The wait deadline passed or the waiting scope ended first.
    TimedOut,
}

struct Waiter {
    tx: oneshot::Sender<OperationNotification>,
    /// Stops the waiter's watchdog once it has been notified.
    notified: CancellationToken,
}

type Waiters = HashMap<OperationId, HashMap<u64, Waiter>>;

/// In-process fan-out of operation events, plus one-shot waiters for callers
/// that block on a single operation's completion.
pub struct InProcOperationEventBus {
    sender: broadcast::Sender<OperationEvent>,
    waiters: Arc<Mutex<Waiters>>,
    next_waiter: AtomicU64,
}

impl std::fmt::Debug for InProcOperationEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let waiting = self.waiters.try_lock().map(|w| w.len()).ok();
        f.debug_struct("InProcOperationEventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("waiting_operations", &waiting)
            .finish()
    }
}

impl InProcOperationEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_waiter: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }

    /// Registers interest in `operation_id` finishing. The returned receiver
    /// resolves once: with the terminal state, or with
    /// [`OperationNotification::TimedOut`] when `timeout` elapses or `scope`
    /// is cancelled first. The registration is dropped either way.
    ///
    /// Register before scheduling the operation so a fast completion is not
    /// missed.
    pub async fn register(
        &self,
        scope: &Scope,
        operation_id: OperationId,
        timeout: Duration,
    ) -> oneshot::Receiver<OperationNotification> {
        let (tx, rx) = oneshot::channel();
        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let notified = CancellationToken::new();
        self.waiters
            .lock()
            .await
            .entry(operation_id)
            .or_default()
            .insert(
                waiter_id,
                Waiter {
                    tx,
                    notified: notified.clone(),
                },
            );

        let waiters = Arc::clone(&self.waiters);
        let scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = notified.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
                _ = scope.cancelled() => {}
            }
            let mut guard = waiters.lock().await;
            let Some(slot) = guard.get_mut(&operation_id) else {
                return;
            };
            if let Some(waiter) = slot.remove(&waiter_id) {
                trace!(%operation_id, "operation waiter timed out");
                let _ = waiter.tx.send(OperationNotification::TimedOut);
            }
            if slot.is_empty() {
                guard.remove(&operation_id);
            }
        });
        rx
    }

    async fn notify(&self, operation_id: OperationId, state: OperationState) {
        let Some(slot) = self.waiters.lock().await.remove(&operation_id) else {
            return;
        };
        for (_, waiter) in slot {
            let _ = waiter.tx.send(OperationNotification::Finished(state));
            waiter.notified.cancel();
        }
    }

    pub async fn waiting(&self, operation_id: OperationId) -> usize {
        self.waiters
            .lock()
            .await
            .get(&operation_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

impl Default for InProcOperationEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl OperationEventPublisher for InProcOperationEventBus {
    async fn publish(&self, event: OperationEvent) -> Result<()> {
        if let Some(state) = event.payload.terminal_state() {
            self.notify(event.meta.operation_id, state).await;
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

pub trait OperationEventStream {
    fn subscribe_operations(&self) -> broadcast::Receiver<OperationEvent>;
}

impl OperationEventStream for InProcOperationEventBus {
    fn subscribe_operations(&self) -> broadcast::Receiver<OperationEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OperationEventPayload;
    use conduit_model::{Operation, OperationCategory, ResourceType};

    fn op() -> Operation {
        Operation::new("i1", ResourceType::Instance, OperationCategory::Create)
    }

    #[tokio::test]
    async fn waiter_receives_terminal_state() {
        let bus = InProcOperationEventBus::default();
        let mut stream = bus.subscribe();
        let mut op = op();
        let rx = bus
            .register(&Scope::root(), op.id, Duration::from_secs(30))
            .await;

        bus.publish(OperationEvent::new(&op, OperationEventPayload::Started))
            .await
            .unwrap();
        op.state = OperationState::Succeeded;
        bus.publish(OperationEvent::settled(&op)).await.unwrap();

        assert_eq!(
            rx.await.unwrap(),
            OperationNotification::Finished(OperationState::Succeeded)
        );
        assert_eq!(bus.waiting(op.id).await, 0);
        assert!(matches!(
            stream.recv().await.unwrap().payload,
            OperationEventPayload::Started
        ));
    }

    #[tokio::test]
    async fn watchdog_stops_once_the_waiter_is_notified() {
        let bus = InProcOperationEventBus::default();
        let mut op = op();
        let rx = bus
            .register(&Scope::root(), op.id, Duration::from_secs(3600))
            .await;
        op.state = OperationState::Failed;
        bus.publish(OperationEvent::settled(&op)).await.unwrap();
        assert_eq!(
            rx.await.unwrap(),
            OperationNotification::Finished(OperationState::Failed)
        );

        // The watchdog holds the only other handle on the waiter table.
        for _ in 0..100 {
            if Arc::strong_count(&bus.waiters) == 1 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("watchdog still running after notification");
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_is_deregistered() {
        let bus = InProcOperationEventBus::default();
        let op = op();
        let rx = bus
            .register(&Scope::root(), op.id, Duration::from_secs(5))
            .await;
        assert_eq!(bus.waiting(op.id).await, 1);

        assert_eq!(rx.await.unwrap(), OperationNotification::TimedOut);
        assert_eq!(bus.waiting(op.id).await, 0);
    }

    #[tokio::test]
    async fn cancelled_scope_releases_waiter() {
        let bus = InProcOperationEventBus::default();
        let op = op();
        let scope = Scope::root();
        let rx = bus.register(&scope, op.id, Duration::from_secs(3600)).await;
        scope.cancel();
        assert_eq!(rx.await.unwrap(), OperationNotification::TimedOut);
    }
}
