use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ControlCommand;

const DEFAULT_CAPACITY: usize = 256;

/// Fire-and-forget pub/sub channel for control commands
///
/// Holds no durable state. Commands published while nobody listens are lost,
/// which is fine: a worker without a subscription no longer holds a lease.
/// Commands for the same job reach a subscriber in publish order.
#[derive(Debug, Clone)]
pub struct ControlBus {
    tx: broadcast::Sender<ControlCommand>,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a command, returning how many subscribers will see it
    pub fn send(&self, command: ControlCommand) -> usize {
        match self.tx.send(command) {
            Ok(receivers) => {
                debug!(job_id = %command.job_id, kind = %command.kind, receivers, "Control command published");
                receivers
            }
            Err(_) => {
                debug!(job_id = %command.job_id, kind = %command.kind, "Control command dropped, no subscribers");
                0
            }
        }
    }

    /// Invoke `handler` for every command published after this call
    ///
    /// Delivery stops when the returned handle is dropped or unsubscribed.
    /// Handlers must tolerate duplicates and commands for unknown jobs.
    pub fn subscribe<F>(&self, handler: F) -> BusSubscription
    where
        F: Fn(ControlCommand) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(command) => handler(command),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Control subscriber lagged, commands dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        BusSubscription { task }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle of a bus subscription; delivery stops on drop
#[derive(Debug)]
pub struct BusSubscription {
    task: JoinHandle<()>,
}

impl BusSubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
