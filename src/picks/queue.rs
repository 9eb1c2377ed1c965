//! Bounded tick-request queue between the aggregator and the dispatcher.
//!
//! Capacity-limited with drop-oldest-non-terminal backpressure: a slow
//! predictor sheds the stalest pending work instead of stalling the
//! aggregator, but a terminal tick is never shed so an event always closes.

use crate::types::TickRequest;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct TickQueue {
    inner: Mutex<VecDeque<TickRequest>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl TickQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a tick request, shedding the oldest non-terminal request
    /// when full.
    pub fn push(&self, request: TickRequest) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|r| !r.terminal) {
                    queue.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Nothing sheddable; drop the incoming request instead
                    // of displacing a terminal tick.
                    if !request.terminal {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    queue.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(request);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next request, waiting if the queue is empty.
    pub async fn pop(&self) -> TickRequest {
        loop {
            if let Some(request) = self.try_pop() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<TickRequest> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Pending requests.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests shed under backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(index: u32, terminal: bool) -> TickRequest {
        TickRequest {
            event_id: 1,
            tick_index: index,
            wave_end_time: 100.0 + index as f64,
            first_pick_time: 100.0,
            station_pick_order: Vec::new(),
            terminal,
        }
    }

    #[test]
    fn sheds_oldest_non_terminal_when_full() {
        let queue = TickQueue::new(3);
        for i in 0..3 {
            queue.push(tick(i, false));
        }
        queue.push(tick(3, false));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().tick_index, 1);
    }

    #[test]
    fn terminal_tick_survives_backpressure() {
        let queue = TickQueue::new(2);
        queue.push(tick(0, false));
        queue.push(tick(1, true));
        queue.push(tick(2, false));

        // The non-terminal tick 0 was shed; terminal tick 1 remains.
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert!(drained.iter().any(|r| r.terminal));
        assert!(!drained.iter().any(|r| r.tick_index == 0));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(TickQueue::new(4));
        let popper = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(tick(7, false));
        let got = popper.await.unwrap();
        assert_eq!(got.tick_index, 7);
    }
}
