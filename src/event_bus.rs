//! Event Bus (spec §4.6, component C6).
//!
//! A bounded, FIFO, multi-producer-single-consumer handoff between the
//! reasoner worker and the HTTP writer. Ordering is exact: whatever the
//! producer publishes, the consumer sees in the same order, with no
//! reordering or coalescing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::WireEvent;

/// Events the bus will drop under backpressure rather than block the
/// reasoner on forever. Everything else (`AnswerChunk`, `Documents`,
/// `Error`, and the terminal events) is never dropped.
fn is_droppable(event: &WireEvent) -> bool {
    matches!(event, WireEvent::Thought { .. } | WireEvent::Action { .. } | WireEvent::Observation { .. })
}

struct Shared {
    cancelled: AtomicBool,
    closed: AtomicBool,
}

pub struct EventBusProducer {
    tx: mpsc::Sender<WireEvent>,
    shared: Arc<Shared>,
}

pub struct EventBusConsumer {
    rx: mpsc::Receiver<WireEvent>,
    shared: Arc<Shared>,
}

/// What the consumer learns from one `consume()` call.
pub enum Consumed {
    Event(WireEvent),
    /// Queue is empty right now but the producer hasn't closed yet.
    Empty,
    /// Producer closed and every buffered event has been drained.
    Finished,
}

pub fn channel(capacity: usize) -> (EventBusProducer, EventBusConsumer) {
    let capacity = capacity.max(ragchat_core::EVENT_BUS_MIN_CAPACITY);
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        closed: AtomicBool::new(false),
    });
    (
        EventBusProducer { tx, shared: shared.clone() },
        EventBusConsumer { rx, shared },
    )
}

impl EventBusProducer {
    /// True once the consumer has called `cancel` — the reasoner should
    /// abort its current streaming completion at the next convenient point.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Relaxed)
    }

    /// Publish one event. Critical events (answer text, citations, errors)
    /// always wait for room; everything else times out after a short
    /// interval and is silently dropped rather than stalling the reasoner
    /// on a slow or stalled client.
    pub async fn publish(&self, event: WireEvent) {
        if self.is_cancelled() {
            return;
        }
        if is_droppable(&event) {
            let timeout = Duration::from_millis(ragchat_core::EVENT_BUS_PUBLISH_TIMEOUT_MS);
            if tokio::time::timeout(timeout, self.tx.send(event)).await.is_err() {
                debug!("event bus full, dropping non-critical event");
            }
        } else {
            let _ = self.tx.send(event).await;
        }
    }

    /// Signal end-of-stream: the consumer drains whatever remains, then sees `Finished`.
    pub fn close(self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}

impl EventBusConsumer {
    /// Poll for the next event, distinguishing "empty but still running"
    /// from "producer finished and queue drained".
    pub async fn consume(&mut self) -> Consumed {
        match self.rx.recv().await {
            Some(event) => Consumed::Event(event),
            None => Consumed::Finished,
        }
    }

    /// Signal "client gone": the producer observes this at its next
    /// `publish` call (or checks it explicitly around blocking reads) and
    /// aborts cleanly instead of continuing to generate.
    pub fn cancel(&self, _reason: &str) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_delivered_in_publish_order() {
        let (producer, mut consumer) = channel(ragchat_core::EVENT_BUS_MIN_CAPACITY);
        producer.publish(WireEvent::AnswerChunk { text: "a".into() }).await;
        producer.publish(WireEvent::AnswerChunk { text: "b".into() }).await;
        producer.close();

        let mut seen = Vec::new();
        loop {
            match consumer.consume().await {
                Consumed::Event(WireEvent::AnswerChunk { text }) => seen.push(text),
                Consumed::Event(_) => {}
                Consumed::Finished => break,
                Consumed::Empty => continue,
            }
        }
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn cancel_is_observed_by_producer() {
        let (producer, consumer) = channel(ragchat_core::EVENT_BUS_MIN_CAPACITY);
        assert!(!producer.is_cancelled());
        consumer.cancel("client disconnected");
        assert!(producer.is_cancelled());
    }

    #[tokio::test]
    async fn close_then_drain_yields_finished() {
        let (producer, mut consumer) = channel(ragchat_core::EVENT_BUS_MIN_CAPACITY);
        producer.publish(WireEvent::Done { session_id: "s".into() }).await;
        producer.close();
        assert!(matches!(consumer.consume().await, Consumed::Event(WireEvent::Done { .. })));
        assert!(matches!(consumer.consume().await, Consumed::Finished));
    }
}
