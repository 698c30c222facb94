use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::warn;


/// A bounded FIFO queue that makes room for new items by discarding the oldest ones. Pushing
///  never blocks; the (single) consumer can wait for items with a timeout.
pub struct DropOldestQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    item_added: Notify,
}
impl<T> DropOldestQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> DropOldestQueue<T> {
        assert!(capacity > 0);

        DropOldestQueue {
            name,
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            item_added: Notify::new(),
        }
    }

    /// appends an item, returning the item that was discarded to make room for it
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut items = self.items.lock();
            let dropped = if items.len() >= self.capacity {
                items.pop_front()
            }
            else {
                None
            };
            items.push_back(item);
            dropped
        };

        if dropped.is_some() {
            warn!(queue = self.name, "queue full - dropping oldest entry");
        }
        self.item_added.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// wakes up a consumer that is currently waiting, even if no item was added
    pub fn wake_consumer(&self) {
        self.item_added.notify_one();
    }

    /// Waits until the queue is non-empty or the timeout expires, without removing anything.
    ///  Returns `true` if there is an item in the queue.
    pub async fn wait_for_item(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.item_added.notified();
            if !self.is_empty() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return !self.is_empty();
            }
        }
    }

    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if self.wait_for_item(timeout).await {
            self.try_pop()
        }
        else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;

    #[test]
    fn test_drops_oldest_first() {
        let queue = DropOldestQueue::new("test", 3);
        for i in 1..=3 {
            assert_eq!(queue.push(i), None);
        }
        assert_eq!(queue.push(4), Some(1));
        assert_eq!(queue.push(5), Some(2));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), Some(4));
        assert_eq!(queue.try_pop(), Some(5));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_expires() {
        let queue = DropOldestQueue::<u32>::new("test", 3);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_interrupted_by_push() {
        let queue = Arc::new(DropOldestQueue::new("test", 3));

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3)).await;
            producer.push(17);
        });

        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(100)).await, Some(17));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_item_does_not_consume() {
        let queue = DropOldestQueue::new("test", 3);
        queue.push(1);
        assert!(queue.wait_for_item(Duration::from_millis(10)).await);
        assert_eq!(queue.len(), 1);
    }
}
