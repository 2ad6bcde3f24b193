//! # Notification Receivers
//!
//! The consuming side of signal delivery. Two kinds of receiver exist:
//!
//! | Receiver | Source | Falling behind |
//! |----------|--------|----------------|
//! | per observer (`notifications_for`) | own unbounded queue | nothing is lost |
//! | all observers (`notifications`) | bounded broadcast tap | oldest skipped, logged and counted |
//!
//! Both see only the notifications produced after they were created.

use quadro_telemetry::MESSAGES_DROPPED;
use quadro_types::{BusKind, Notification};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{
    errors::BroadcastStreamRecvError, BroadcastStream, UnboundedReceiverStream,
};
use tokio_stream::Stream;
use tracing::warn;

/// Errors from receiving notifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// The bus handle was closed.
    #[error("notification channel closed")]
    Closed,
}

enum Source {
    All(broadcast::Receiver<Notification>),
    Observer {
        id: String,
        queue: mpsc::UnboundedReceiver<Notification>,
    },
}

/// Receives notifications from one bus handle.
pub struct NotificationReceiver {
    bus: BusKind,
    source: Source,
}

fn record_lag(bus: BusKind, count: u64) {
    warn!(bus = %bus, lagged = count, "Notification tap fell behind, notifications skipped");
    MESSAGES_DROPPED
        .with_label_values(&[bus.as_str(), "lagged"])
        .inc_by(count);
}

impl NotificationReceiver {
    /// Receiver on the all-observers tap.
    pub(crate) fn all(bus: BusKind, receiver: broadcast::Receiver<Notification>) -> Self {
        Self {
            bus,
            source: Source::All(receiver),
        }
    }

    /// Receiver draining one observer's queue.
    pub(crate) fn observer(
        bus: BusKind,
        observer_id: impl Into<String>,
        queue: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        Self {
            bus,
            source: Source::Observer {
                id: observer_id.into(),
                queue,
            },
        }
    }

    /// Observer this receiver is bound to, if any.
    #[must_use]
    pub fn observer_id(&self) -> Option<&str> {
        match &self.source {
            Source::All(_) => None,
            Source::Observer { id, .. } => Some(id),
        }
    }

    #[must_use]
    pub fn bus(&self) -> BusKind {
        self.bus
    }

    /// Receive the next notification.
    ///
    /// # Returns
    ///
    /// - `Some(notification)` - The next notification
    /// - `None` - The bus handle was closed
    pub async fn recv(&mut self) -> Option<Notification> {
        match &mut self.source {
            Source::Observer { queue, .. } => queue.recv().await,
            Source::All(receiver) => loop {
                match receiver.recv().await {
                    Ok(notification) => return Some(notification),
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(count)) => record_lag(self.bus, count),
                }
            },
        }
    }

    /// Try to receive the next notification without waiting.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(notification))` - A notification was available
    /// - `Ok(None)` - Nothing available right now
    /// - `Err(ReceiveError::Closed)` - The bus handle was closed
    pub fn try_recv(&mut self) -> Result<Option<Notification>, ReceiveError> {
        match &mut self.source {
            Source::Observer { queue, .. } => match queue.try_recv() {
                Ok(notification) => Ok(Some(notification)),
                Err(mpsc::error::TryRecvError::Empty) => Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => Err(ReceiveError::Closed),
            },
            Source::All(receiver) => loop {
                match receiver.try_recv() {
                    Ok(notification) => return Ok(Some(notification)),
                    Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                    Err(broadcast::error::TryRecvError::Closed) => {
                        return Err(ReceiveError::Closed)
                    }
                    Err(broadcast::error::TryRecvError::Lagged(count)) => {
                        record_lag(self.bus, count);
                    }
                }
            },
        }
    }

    /// Block the calling thread until the next notification.
    ///
    /// Must not be called from inside an async context.
    pub fn blocking_recv(&mut self) -> Option<Notification> {
        futures::executor::block_on(self.recv())
    }

    /// Convert into a [`Stream`].
    #[must_use]
    pub fn into_stream(self) -> NotificationStream {
        let inner = match self.source {
            Source::All(receiver) => StreamSource::All(BroadcastStream::new(receiver)),
            Source::Observer { queue, .. } => {
                StreamSource::Observer(UnboundedReceiverStream::new(queue))
            }
        };
        NotificationStream {
            bus: self.bus,
            inner,
        }
    }
}

enum StreamSource {
    All(BroadcastStream<Notification>),
    Observer(UnboundedReceiverStream<Notification>),
}

/// A [`NotificationReceiver`] as a `tokio_stream::Stream`.
pub struct NotificationStream {
    bus: BusKind,
    inner: StreamSource,
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let bus = self.bus;
        match &mut self.inner {
            StreamSource::Observer(queue) => Pin::new(queue).poll_next(cx),
            StreamSource::All(tap) => loop {
                match ready!(Pin::new(&mut *tap).poll_next(cx)) {
                    None => return Poll::Ready(None),
                    Some(Ok(notification)) => return Poll::Ready(Some(notification)),
                    Some(Err(BroadcastStreamRecvError::Lagged(count))) => record_lag(bus, count),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadro_types::{Endpoint, NotificationPayload, Variant};
    use tokio_stream::StreamExt;

    fn notification(observer: &str, value: i64) -> Notification {
        Notification {
            bus: BusKind::Session,
            observer_id: observer.to_string(),
            endpoint: Endpoint::new("org.example.Clock", "/Clock", "org.example.Clock", "Tick"),
            payload: NotificationPayload::from_positional(vec![Variant::Int(value)]),
        }
    }

    fn value(notification: &Notification) -> Option<i64> {
        notification.payload.get("0").and_then(Variant::as_i64)
    }

    #[tokio::test]
    async fn test_observer_queue_keeps_every_notification() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = NotificationReceiver::observer(BusKind::Session, "ui-2", rx);
        assert_eq!(receiver.observer_id(), Some("ui-2"));

        for v in 0..100 {
            tx.send(notification("ui-2", v)).unwrap();
        }

        for expected in 0..100 {
            let received = receiver.recv().await.unwrap();
            assert_eq!(value(&received), Some(expected));
        }
        assert_eq!(receiver.try_recv(), Ok(None));

        drop(tx);
        assert_eq!(receiver.try_recv(), Err(ReceiveError::Closed));
    }

    #[tokio::test]
    async fn test_receiver_reports_close() {
        let (tx, rx) = broadcast::channel(4);
        let mut receiver = NotificationReceiver::all(BusKind::System, rx);
        drop(tx);
        assert!(receiver.recv().await.is_none());
        assert_eq!(receiver.try_recv(), Err(ReceiveError::Closed));
    }

    #[test]
    fn test_lagged_tap_skips_and_counts_lost_notifications() {
        let lagged = MESSAGES_DROPPED.with_label_values(&["system", "lagged"]);
        let before = lagged.get();

        let (tx, rx) = broadcast::channel(2);
        let mut receiver = NotificationReceiver::all(BusKind::System, rx);
        for v in 0..5 {
            tx.send(notification("ui-1", v)).unwrap();
        }

        let first = receiver.try_recv().unwrap().unwrap();
        assert_eq!(value(&first), Some(3));
        let second = receiver.blocking_recv().unwrap();
        assert_eq!(value(&second), Some(4));
        assert!(lagged.get() >= before + 3);
    }

    #[tokio::test]
    async fn test_streams_yield_in_order() {
        let (tx, rx) = broadcast::channel(16);
        let tap = NotificationReceiver::all(BusKind::Session, rx).into_stream();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let observer = NotificationReceiver::observer(BusKind::Session, "ui-1", queue_rx).into_stream();

        for v in [1, 9, 2] {
            tx.send(notification("ui-1", v)).unwrap();
            queue_tx.send(notification("ui-1", v)).unwrap();
        }
        drop(tx);
        drop(queue_tx);

        let from_tap: Vec<i64> = tap.map(|n| value(&n).unwrap()).collect().await;
        let from_queue: Vec<i64> = observer.map(|n| value(&n).unwrap()).collect().await;
        assert_eq!(from_tap, vec![1, 9, 2]);
        assert_eq!(from_queue, from_tap);
    }
}
