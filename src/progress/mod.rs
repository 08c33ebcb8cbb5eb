//! In-process progress pub/sub.
//!
//! Observers subscribe per order and receive saga events in publish
//! order until a terminal marker. Publishing never blocks orchestration:
//! each subscriber has a bounded buffer and a slow consumer loses the
//! oldest events, surfaced in-stream as a [`ProgressItem::Dropped`]
//! marker rather than backpressure.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use crate::model::OrderEvent;

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum ProgressItem {
    /// A saga event, in publish order.
    Event(Arc<OrderEvent>),
    /// The subscriber's buffer overflowed; this many events were
    /// dropped (oldest first).
    Dropped(u64),
    /// The execution reached a terminal state; no further events will
    /// arrive and the stream ends.
    Terminal,
}

#[derive(Debug, Clone)]
enum Signal {
    Event(Arc<OrderEvent>),
    Terminal,
}

/// Per-order fanout of saga events over bounded broadcast channels.
pub struct ProgressBus {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<Signal>>>,
    buffer_size: usize,
}

impl ProgressBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Subscribe to an order's live events.
    ///
    /// Only events published after subscription are delivered; history
    /// lives in the timeline projection.
    pub fn subscribe(&self, order_id: Uuid) -> ProgressStream {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(order_id)
            .or_insert_with(|| broadcast::channel(self.buffer_size).0);
        ProgressStream {
            inner: BroadcastStream::new(sender.subscribe()),
            done: false,
        }
    }

    /// Publish an event to the order's subscribers, if any.
    ///
    /// Never blocks; without subscribers the event is simply not
    /// fanned out.
    pub fn publish(&self, event: &OrderEvent) {
        let channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.get(&event.order_id) {
            let delivered = sender.send(Signal::Event(Arc::new(event.clone())));
            debug!(
                order_id = %event.order_id,
                event_type = %event.event_type,
                receivers = delivered.map(|n| n as u64).unwrap_or(0),
                "progress event published"
            );
        }
    }

    /// Emit the terminal marker and tear the order's channel down.
    pub fn publish_terminal(&self, order_id: Uuid) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.remove(&order_id) {
            let _ = sender.send(Signal::Terminal);
            debug!(order_id = %order_id, "progress channel closed");
        }
    }

    /// Number of live subscribers for an order.
    pub fn subscriber_count(&self, order_id: Uuid) -> usize {
        let channels = self.channels.lock().unwrap();
        channels
            .get(&order_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

/// Ordered stream of progress items for one subscriber.
///
/// Ends after the terminal marker (or when the bus side is dropped).
pub struct ProgressStream {
    inner: BroadcastStream<Signal>,
    done: bool,
}

impl Stream for ProgressStream {
    type Item = ProgressItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(Signal::Event(event)))) => {
                Poll::Ready(Some(ProgressItem::Event(event)))
            }
            Poll::Ready(Some(Ok(Signal::Terminal))) => {
                this.done = true;
                Poll::Ready(Some(ProgressItem::Terminal))
            }
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                Poll::Ready(Some(ProgressItem::Dropped(count)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderEventType;
    use chrono::Utc;
    use tokio_stream::StreamExt;

    fn make_event(order_id: Uuid, event_type: OrderEventType) -> OrderEvent {
        OrderEvent::new(order_id, event_type, Utc::now())
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let bus = ProgressBus::new(64);
        let order_id = Uuid::new_v4();
        let mut stream = bus.subscribe(order_id);

        bus.publish(&make_event(order_id, OrderEventType::SagaStarted));
        bus.publish(&make_event(order_id, OrderEventType::StepStarted));
        bus.publish(&make_event(order_id, OrderEventType::StepCompleted));
        bus.publish_terminal(order_id);

        let mut types = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                ProgressItem::Event(event) => types.push(event.event_type),
                ProgressItem::Terminal => break,
                ProgressItem::Dropped(_) => panic!("nothing should drop"),
            }
        }
        assert_eq!(
            types,
            vec![
                OrderEventType::SagaStarted,
                OrderEventType::StepStarted,
                OrderEventType::StepCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal() {
        let bus = ProgressBus::new(64);
        let order_id = Uuid::new_v4();
        let mut stream = bus.subscribe(order_id);

        bus.publish_terminal(order_id);

        assert!(matches!(stream.next().await, Some(ProgressItem::Terminal)));
        assert!(stream.next().await.is_none());
        assert_eq!(bus.subscriber_count(order_id), 0);
    }

    #[tokio::test]
    async fn test_overflow_surfaces_dropped_marker() {
        let bus = ProgressBus::new(4);
        let order_id = Uuid::new_v4();
        let mut stream = bus.subscribe(order_id);

        // A slow subscriber: publish well past the buffer before reading.
        for _ in 0..10 {
            bus.publish(&make_event(order_id, OrderEventType::StepStarted));
        }
        bus.publish_terminal(order_id);

        let first = stream.next().await.unwrap();
        let ProgressItem::Dropped(count) = first else {
            panic!("expected a dropped marker, got {first:?}");
        };
        assert!(count > 0);

        // The rest of the buffer still arrives, then the terminal.
        let mut saw_terminal = false;
        while let Some(item) = stream.next().await {
            if matches!(item, ProgressItem::Terminal) {
                saw_terminal = true;
            }
        }
        assert!(saw_terminal);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = ProgressBus::new(64);
        let order_id = Uuid::new_v4();
        // Must not panic or block.
        bus.publish(&make_event(order_id, OrderEventType::SagaStarted));
        bus.publish_terminal(order_id);
    }
}
