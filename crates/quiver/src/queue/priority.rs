//! The blocking priority queues the dispatchers drain.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::pin::pin;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::request::Request;

/// Heap entry ordered by priority first, then submission order within one
/// priority level.
struct Pending(Arc<Request>);

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            // Lower sequence numbers dispatch first.
            .then_with(|| other.0.sequence().cmp(&self.0.sequence()))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Pending>,
    closed: bool,
}

/// An unbounded priority queue with an async blocking take and close
/// semantics: closing wakes every waiting taker, which then observes `None`
/// and exits its loop. Queued requests survive a close and are dispatched
/// again after [`reopen`](Self::reopen).
#[derive(Default)]
pub(crate) struct PendingQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, request: Arc<Request>) {
        self.state.lock().unwrap().heap.push(Pending(request));
        self.notify.notify_waiters();
    }

    /// Takes the highest-priority request, waiting until one is available.
    /// Returns `None` once the queue is closed.
    pub(crate) async fn take(&self) -> Option<Arc<Request>> {
        let mut notified = pin!(self.notify.notified());
        loop {
            // Register for wakeups before checking, so a push racing with
            // the check cannot be lost.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return None;
                }
                if let Some(Pending(request)) = state.heap.pop() {
                    return Some(request);
                }
            }

            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Closes the queue, waking all pending takers.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn reopen(&self) {
        self.state.lock().unwrap().closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::parsers::StringParser;
    use crate::request::{Listener, Priority, Request};

    fn request(priority: Priority, sequence: u64) -> Arc<Request> {
        let listener: Listener<String> = Box::new(|_| {});
        let request = Request::get(format!("http://example.com/{sequence}"))
            .priority(priority)
            .build(StringParser::uncached(), listener);
        request.set_sequence(sequence);
        request
    }

    #[tokio::test]
    async fn test_priority_beats_fifo() {
        let queue = PendingQueue::new();
        queue.push(request(Priority::Normal, 1));
        queue.push(request(Priority::Normal, 2));
        queue.push(request(Priority::High, 3));

        assert_eq!(queue.take().await.unwrap().sequence(), 3);
        assert_eq!(queue.take().await.unwrap().sequence(), 1);
        assert_eq!(queue.take().await.unwrap().sequence(), 2);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = PendingQueue::new();
        for sequence in [5, 3, 9, 1] {
            queue.push(request(Priority::Normal, sequence));
        }

        let mut order = vec![];
        for _ in 0..4 {
            order.push(queue.take().await.unwrap().sequence());
        }
        assert_eq!(order, vec![1, 3, 5, 9]);
    }

    #[tokio::test]
    async fn test_take_waits_for_push() {
        let queue = Arc::new(PendingQueue::new());

        let taker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take().await.unwrap().sequence() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request(Priority::Normal, 7));

        assert_eq!(taker.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_close_wakes_takers() {
        let queue = Arc::new(PendingQueue::new());

        let taker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.take().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(taker.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requests_survive_close() {
        let queue = PendingQueue::new();
        queue.push(request(Priority::Normal, 1));
        queue.close();

        assert!(queue.take().await.is_none());

        queue.reopen();
        assert_eq!(queue.take().await.unwrap().sequence(), 1);
    }
}
