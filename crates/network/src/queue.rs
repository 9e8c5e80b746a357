//! Thread-safe message queues decoupling network I/O tasks from
//! processing/sending tasks.
//!
//! Producers never block. Consumers either await the next item or poll; once
//! a queue is marked complete, blocked consumers wake with an end-of-stream
//! `None` and further enqueues fail loudly.

use messenger_types::Message;

use crate::error::{NetworkError, NetworkResult};

/// One FIFO channel with close semantics.
#[derive(Clone)]
struct Fifo {
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
}

impl Fifo {
    fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    fn enqueue(&self, message: Message) -> NetworkResult<()> {
        self.tx
            .try_send(message)
            .map_err(|_| NetworkError::QueueClosed)
    }

    /// Await the next item; `None` is the end-of-stream signal after
    /// `mark_complete` once the queue has drained.
    async fn dequeue(&self) -> Option<Message> {
        self.rx.recv().await.ok()
    }

    fn try_dequeue(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Idempotent. Wakes every blocked consumer; items already queued can
    /// still be drained.
    fn mark_complete(&self) {
        self.tx.close();
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}

/// The incoming/outgoing queue pair shared between the connection manager
/// and its consumers.
#[derive(Clone)]
pub struct MessageQueue {
    incoming: Fifo,
    outgoing: Fifo,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            incoming: Fifo::new(),
            outgoing: Fifo::new(),
        }
    }

    /// Enqueue a message received from the network.
    pub fn enqueue_incoming(&self, message: Message) -> NetworkResult<()> {
        self.incoming.enqueue(message)
    }

    /// Await the next received message; `None` once the queue completes.
    pub async fn dequeue_incoming(&self) -> Option<Message> {
        self.incoming.dequeue().await
    }

    pub fn try_dequeue_incoming(&self) -> Option<Message> {
        self.incoming.try_dequeue()
    }

    /// Enqueue a message to be sent to peers.
    pub fn enqueue_outgoing(&self, message: Message) -> NetworkResult<()> {
        self.outgoing.enqueue(message)
    }

    /// Await the next message to send; `None` once the queue completes.
    pub async fn dequeue_outgoing(&self) -> Option<Message> {
        self.outgoing.dequeue().await
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Signal that no more messages will be added to either queue.
    pub fn mark_complete(&self) {
        self.incoming.mark_complete();
        self.outgoing.mark_complete();
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messenger_types::Message;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let queue = MessageQueue::new();
        queue.enqueue_incoming(Message::plain("a", "first")).unwrap();
        queue.enqueue_incoming(Message::plain("a", "second")).unwrap();

        assert_eq!(queue.incoming_len(), 2);
        assert_eq!(queue.dequeue_incoming().await.unwrap().content(), Some("first"));
        assert_eq!(queue.dequeue_incoming().await.unwrap().content(), Some("second"));
    }

    #[tokio::test]
    async fn test_blocking_dequeue_wakes_on_enqueue() {
        let queue = MessageQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_incoming().await })
        };

        // Give the consumer a chance to park first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue_incoming(Message::plain("a", "wake up")).unwrap();

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received.content(), Some("wake up"));
    }

    #[tokio::test]
    async fn test_try_dequeue_never_blocks() {
        let queue = MessageQueue::new();
        assert!(queue.try_dequeue_incoming().is_none());

        queue.enqueue_incoming(Message::plain("a", "x")).unwrap();
        assert!(queue.try_dequeue_incoming().is_some());
        assert!(queue.try_dequeue_incoming().is_none());
    }

    #[tokio::test]
    async fn test_mark_complete_wakes_consumers_and_rejects_producers() {
        let queue = MessageQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_incoming().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.mark_complete();
        // Idempotent.
        queue.mark_complete();

        assert!(consumer.await.unwrap().is_none());
        assert!(matches!(
            queue.enqueue_incoming(Message::plain("a", "late")),
            Err(NetworkError::QueueClosed)
        ));
        assert!(matches!(
            queue.enqueue_outgoing(Message::plain("a", "late")),
            Err(NetworkError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_queued_items_survive_completion() {
        let queue = MessageQueue::new();
        queue.enqueue_outgoing(Message::plain("a", "pending")).unwrap();
        queue.mark_complete();

        assert_eq!(queue.dequeue_outgoing().await.unwrap().content(), Some("pending"));
        assert!(queue.dequeue_outgoing().await.is_none());
    }
}
