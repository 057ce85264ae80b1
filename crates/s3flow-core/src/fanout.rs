use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::outbound::OutEvent;

/// Bounded queue depth for each registered subscriber. A subscriber that
/// can't keep up is dropped rather than allowed to back-pressure the whole
/// fan-out task.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Registers a new outbound-event subscriber with the running fan-out task.
pub type Subscribe = mpsc::Sender<OutEvent>;

/// Multiplexes the single outbound event stream to N subscribers. A single
/// task owns the subscriber list — no locking needed, since it is the sole
/// reader and writer of it. Mirrors the original per-connection queue
/// discipline, generalized from one struct per connection to one task
/// serving every registered queue.
pub struct Fanout {
    subscribers: Vec<Subscribe>,
}

impl Fanout {
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<OutEvent>,
        mut register_rx: mpsc::Receiver<Subscribe>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events_rx.recv() => {
                    let Some(event) = event else { return };
                    self.broadcast(event);
                }
                subscriber = register_rx.recv() => {
                    let Some(subscriber) = subscriber else { return };
                    debug!(total = self.subscribers.len() + 1, "registered outbound subscriber");
                    self.subscribers.push(subscriber);
                }
            }
        }
    }

    fn broadcast(&mut self, event: OutEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("dropping outbound subscriber: queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutEvent;

    #[tokio::test]
    async fn broadcasts_to_every_registered_subscriber() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (register_tx, register_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();

        let handle = tokio::spawn(Fanout::new().run(events_rx, register_rx, cancel_for_run));

        let (sub1_tx, mut sub1_rx) = mpsc::channel(8);
        let (sub2_tx, mut sub2_rx) = mpsc::channel(8);
        register_tx.send(sub1_tx).await.unwrap();
        register_tx.send(sub2_tx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        events_tx.send(OutEvent::reset("bucket-a")).await.unwrap();

        assert_eq!(sub1_rx.recv().await.unwrap().image_bucket, "bucket-a");
        assert_eq!(sub2_rx.recv().await.unwrap().image_bucket, "bucket-a");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drops_a_subscriber_whose_queue_is_full() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (register_tx, register_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();

        let handle = tokio::spawn(Fanout::new().run(events_rx, register_rx, cancel_for_run));

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        register_tx.send(slow_tx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        for _ in 0..4 {
            events_tx.send(OutEvent::reset("bucket-a")).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (probe_tx, mut probe_rx) = mpsc::channel(8);
        register_tx.send(probe_tx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        events_tx.send(OutEvent::reset("bucket-b")).await.unwrap();
        assert_eq!(probe_rx.recv().await.unwrap().image_bucket, "bucket-b");

        cancel.cancel();
        handle.await.unwrap();
    }
}
