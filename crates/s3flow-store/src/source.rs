use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::ObjectStore;
use crate::error::StoreError;
use crate::event::{Event, EventType, ObjectType};

/// Produces a stream of raw [`Event`]s for a single bucket onto a shared
/// channel. Implementations know nothing about image groups or selectors;
/// classification happens downstream.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Runs until `cancel` fires or an unrecoverable error occurs, sending
    /// events to `tx`. `ready`, if given, is signalled exactly once, right
    /// after this source's initial full sweep of the bucket completes (the
    /// first poll tick, or the notification source's startup reconciliation
    /// poll) — the caller uses this to emit the synthetic `Reset` event at
    /// the right moment instead of guessing when the sweep is done. Returns
    /// `Ok(())` on a clean cancellation-driven exit.
    async fn run(&self, tx: mpsc::Sender<Event>, ready: Option<mpsc::Sender<()>>, cancel: CancellationToken) -> Result<(), StoreError>;
}

/// Polls a bucket on a fixed period, emitting one `create` event per listed
/// object with `object_type` left unset for the classifier to fill in.
/// Signals `ready` once the first tick's listing has been fully emitted, so
/// the caller can follow it with the synthetic `Reset` event.
pub struct PollingSource {
    client: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    period: Duration,
}

impl PollingSource {
    pub fn new(client: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>, period: Duration) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            period,
        }
    }
}

#[async_trait]
impl ObjectSource for PollingSource {
    async fn run(&self, tx: mpsc::Sender<Event>, ready: Option<mpsc::Sender<()>>, cancel: CancellationToken) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ready = ready;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(bucket = %self.bucket, "polling source cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    debug!(bucket = %self.bucket, "polling bucket");
                    let now = chrono::Utc::now();
                    let objects = self.client.list_objects(&self.bucket, &self.prefix).await?;

                    for object in objects {
                        let event = Event {
                            time: now,
                            bucket: self.bucket.clone(),
                            event_type: EventType::Create,
                            object_type: None,
                            size: object.size,
                            object_key: object.key,
                            object_last_modified: object.last_modified,
                        };

                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }

                    if let Some(signal) = ready.take() {
                        let _ = signal.send(()).await;
                    }
                }
            }
        }
    }
}

/// A single notification delivered by whatever external transport the
/// deployment uses (SQS, a webhook receiver, …). Parsing that transport's
/// wire format into this shape is the transport's job, not this crate's —
/// the same way configuration parsing lives outside the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub object_type: ObjectType,
    pub event_type: EventType,
    pub key: String,
    pub size: i64,
    pub event_time: chrono::DateTime<chrono::Utc>,
    pub error: Option<String>,
}

/// Subscribes to create/remove notifications for a bucket, fed by an
/// external transport through `notifications`. Performs a startup
/// reconciliation poll (some notification backends can silently miss events
/// delivered before the subscription is live) before switching to
/// notification-driven mode. A notification carrying an error bubbles up and
/// ends the loop; the event channel is closed on context cancellation.
pub struct NotificationSource {
    client: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    notifications: tokio::sync::Mutex<mpsc::Receiver<RawNotification>>,
}

impl NotificationSource {
    pub fn new(
        client: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        notifications: mpsc::Receiver<RawNotification>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            notifications: tokio::sync::Mutex::new(notifications),
        }
    }
}

#[async_trait]
impl ObjectSource for NotificationSource {
    async fn run(&self, tx: mpsc::Sender<Event>, ready: Option<mpsc::Sender<()>>, cancel: CancellationToken) -> Result<(), StoreError> {
        let reconcile_time = chrono::Utc::now();
        let objects = self.client.list_objects(&self.bucket, &self.prefix).await?;
        for object in objects {
            let event = Event {
                time: reconcile_time,
                bucket: self.bucket.clone(),
                event_type: EventType::Create,
                object_type: None,
                size: object.size,
                object_key: object.key,
                object_last_modified: object.last_modified,
            };
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }

        if let Some(signal) = ready {
            let _ = signal.send(()).await;
        }

        let mut notifications = self.notifications.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(bucket = %self.bucket, "notification source cancelled");
                    return Ok(());
                }
                notif = notifications.recv() => {
                    let Some(notif) = notif else {
                        info!(bucket = %self.bucket, "notification channel closed upstream");
                        return Ok(());
                    };

                    if let Some(message) = notif.error {
                        error!(bucket = %self.bucket, "notification subscription error: {}", message);
                        return Err(StoreError::NotificationFailed { bucket: self.bucket.clone(), message });
                    }

                    let event = Event {
                        time: notif.event_time,
                        bucket: self.bucket.clone(),
                        event_type: notif.event_type,
                        object_type: Some(notif.object_type),
                        size: notif.size,
                        object_key: notif.key,
                        object_last_modified: notif.event_time,
                    };

                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockObjectStore;

    #[tokio::test]
    async fn polling_source_emits_one_event_per_listed_object() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_objects().returning(|_, _| {
            Ok(vec![crate::client::ObjectMeta {
                key: "previews/a/preview.jpg".to_string(),
                size: 42,
                last_modified: chrono::Utc::now(),
            }])
        });

        let source = PollingSource::new(Arc::new(mock), "previews", "", Duration::from_millis(10));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();

        let handle = tokio::spawn(async move { source.run(tx, None, cancel_for_run).await });

        let event = rx.recv().await.expect("expected one event from first tick");
        assert_eq!(event.object_key, "previews/a/preview.jpg");
        assert_eq!(event.event_type, EventType::Create);
        assert!(event.object_type.is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn polling_source_signals_ready_after_first_tick() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_objects().returning(|_, _| Ok(vec![]));

        let source = PollingSource::new(Arc::new(mock), "previews", "", Duration::from_millis(10));
        let (tx, _rx) = mpsc::channel(8);
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();

        let handle = tokio::spawn(async move { source.run(tx, Some(ready_tx), cancel_for_run).await });

        ready_rx.recv().await.expect("expected a ready signal after the first sweep");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn notification_source_reconciles_before_switching_to_notifications() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_objects().returning(|_, _| {
            Ok(vec![crate::client::ObjectMeta {
                key: "previews/a/preview.jpg".to_string(),
                size: 1,
                last_modified: chrono::Utc::now(),
            }])
        });

        let (notif_tx, notif_rx) = mpsc::channel(8);
        let source = NotificationSource::new(Arc::new(mock), "previews", "", notif_rx);
        let (tx, mut rx) = mpsc::channel(8);
        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();

        let handle = tokio::spawn(async move { source.run(tx, Some(ready_tx), cancel_for_run).await });

        let reconciled = rx.recv().await.expect("expected the reconciliation event");
        assert_eq!(reconciled.object_key, "previews/a/preview.jpg");
        ready_rx.recv().await.expect("expected a ready signal once reconciliation completes");

        notif_tx
            .send(RawNotification {
                object_type: ObjectType::Preview,
                event_type: EventType::Create,
                key: "previews/a/preview.jpg".to_string(),
                size: 2,
                event_time: chrono::Utc::now(),
                error: None,
            })
            .await
            .unwrap();

        let live = rx.recv().await.expect("expected the live notification event");
        assert_eq!(live.size, 2);
        assert_eq!(live.object_type, Some(ObjectType::Preview));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn notification_error_bubbles_up_as_store_error() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_objects().returning(|_, _| Ok(vec![]));

        let (notif_tx, notif_rx) = mpsc::channel(8);
        let source = NotificationSource::new(Arc::new(mock), "previews", "", notif_rx);
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        notif_tx
            .send(RawNotification {
                object_type: ObjectType::Preview,
                event_type: EventType::Create,
                key: "x".to_string(),
                size: 0,
                event_time: chrono::Utc::now(),
                error: Some("subscription dropped".to_string()),
            })
            .await
            .unwrap();

        let result = source.run(tx, None, cancel).await;
        assert!(matches!(result, Err(StoreError::NotificationFailed { .. })));
    }
}
