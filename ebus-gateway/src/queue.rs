//! Thread-safe queue of bus requests.
//!
//! The pending queue carries client work towards the bus thread, the
//! finished queue carries completed requests back. `remove(id, wait)` on
//! the finished queue is the synchronization point of `send_and_wait`: the
//! client pushes onto pending, then blocks until the bus thread hands the
//! same request back.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::request::Request;

/// FIFO of owned [`Request`] values, shared between client threads and the
/// bus thread.
#[derive(Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<Request>>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request and wakes all waiters.
    pub fn push(&self, request: Request) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(request);
        self.available.notify_all();
    }

    /// Removes the head, waiting up to `timeout` for the queue to fill.
    /// `None` timeout means no wait at all.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Request> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timeout) = timeout {
            let deadline = std::time::Instant::now() + timeout;
            while queue.is_empty() {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (guard, result) = self
                    .available
                    .wait_timeout(queue, remaining)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
                if result.timed_out() {
                    break;
                }
            }
        }
        queue.pop_front()
    }

    /// The id of the head request without removing it.
    pub fn peek_id(&self) -> Option<u64> {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.front().map(|r| r.id())
    }

    /// Removes the request with the given id. With `wait`, blocks until it
    /// appears; otherwise returns `None` when it is not queued.
    pub fn remove(&self, id: u64, wait: bool) -> Option<Request> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(position) = queue.iter().position(|r| r.id() == id) {
                return queue.remove(position);
            }
            if !wait {
                return None;
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebus_rs::SymbolBuffer;
    use std::sync::Arc;
    use std::thread;

    fn request() -> Request {
        Request::active(SymbolBuffer::new(true))
    }

    #[test]
    fn fifo_order() {
        let queue = RequestQueue::new();
        let first = request();
        let second = request();
        let first_id = first.id();
        let second_id = second.id();
        queue.push(first);
        queue.push(second);
        assert_eq!(queue.peek_id(), Some(first_id));
        assert_eq!(queue.pop(None).map(|r| r.id()), Some(first_id));
        assert_eq!(queue.pop(None).map(|r| r.id()), Some(second_id));
        assert!(queue.pop(None).is_none());
    }

    #[test]
    fn pop_respects_timeout() {
        let queue = RequestQueue::new();
        let start = std::time::Instant::now();
        assert!(queue.pop(Some(Duration::from_millis(20))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn remove_by_id() {
        let queue = RequestQueue::new();
        let first = request();
        let second = request();
        let second_id = second.id();
        queue.push(first);
        queue.push(second);
        assert!(queue.remove(second_id, false).is_some());
        assert!(queue.remove(second_id, false).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_waits_for_the_request_to_appear() {
        let queue = Arc::new(RequestQueue::new());
        let req = request();
        let id = req.id();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push(req);
            })
        };

        let removed = queue.remove(id, true);
        assert_eq!(removed.map(|r| r.id()), Some(id));
        producer.join().unwrap();
    }
}
