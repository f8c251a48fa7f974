//! # Event Queue
//!
//! Bounded hand-off from the I/O thread to the processing task.
//!
//! ## Overflow Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  push(event) with queue at capacity                                     │
//! │                                                                         │
//! │   oldest TagRead in queue? ── yes ──► evict it, append event            │
//! │            │                                                            │
//! │            no                                                           │
//! │            ▼                                                            │
//! │   event is a TagRead? ─────── yes ──► drop the incoming event           │
//! │            │                                                            │
//! │            no                                                           │
//! │            ▼                                                            │
//! │   append anyway (acks, rounds, faults and sensor edges are kept)       │
//! │                                                                         │
//! │  Every drop increments `dropped`.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The producer never waits. The queue can only grow past its capacity when
//! it holds no tag reads at all.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use portal_core::Message;
use tokio::sync::Notify;

/// One decoded message with its arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub message: Message,
    pub received_at: Instant,
}

impl LinkEvent {
    pub fn new(message: Message, received_at: Instant) -> Self {
        LinkEvent {
            message,
            received_at,
        }
    }
}

struct State {
    items: VecDeque<LinkEvent>,
    closed: bool,
}

pub(crate) struct EventQueue {
    state: Mutex<State>,
    ready: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        EventQueue {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `event`. Returns false if a tag read was dropped to make room
    /// (either an older one or `event` itself).
    pub(crate) fn push(&self, event: LinkEvent) -> bool {
        let mut state = self.lock();
        if state.closed {
            return true;
        }

        let mut kept = true;
        if state.items.len() >= self.capacity {
            let oldest_read = state.items.iter().position(|e| e.message.is_droppable());
            match oldest_read {
                Some(index) => {
                    state.items.remove(index);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    kept = false;
                }
                None if event.message.is_droppable() => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                None => {}
            }
        }

        state.items.push_back(event);
        drop(state);
        self.ready.notify_one();
        kept
    }

    /// Waits for the next event. `None` once closed and drained.
    pub(crate) async fn recv(&self) -> Option<LinkEvent> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting events. Already queued events are still delivered.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::codec::{CommandAck, TagRead};
    use portal_core::{AntennaId, Rssi, SensorEdge, SensorId};

    fn read(n: u8) -> LinkEvent {
        LinkEvent::new(
            Message::TagRead(TagRead {
                antenna: AntennaId::ONE,
                pc: 0x3000,
                epc: portal_core::TagIdentity::new(vec![0, n]).unwrap(),
                rssi: Rssi::from_raw(0x50),
                frequency_code: 0,
            }),
            Instant::now(),
        )
    }

    fn ack() -> LinkEvent {
        LinkEvent::new(
            Message::CommandAck(CommandAck {
                command: 0x76,
                status: 0x10,
            }),
            Instant::now(),
        )
    }

    fn edge() -> LinkEvent {
        LinkEvent::new(
            Message::SensorEdge(SensorEdge::rising(SensorId::One)),
            Instant::now(),
        )
    }

    fn epc_of(event: &LinkEvent) -> Option<u8> {
        match &event.message {
            Message::TagRead(t) => Some(t.epc.as_bytes()[1]),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new(8);
        queue.push(read(1));
        queue.push(ack());
        queue.push(read(2));

        assert_eq!(epc_of(&queue.recv().await.unwrap()), Some(1));
        assert!(matches!(queue.recv().await.unwrap().message, Message::CommandAck(_)));
        assert_eq!(epc_of(&queue.recv().await.unwrap()), Some(2));
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_read() {
        let queue = EventQueue::new(3);
        queue.push(read(1));
        queue.push(ack());
        queue.push(read(2));
        assert!(!queue.push(read(3)));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.recv().await.unwrap().message, Message::CommandAck(_)));
        assert_eq!(epc_of(&queue.recv().await.unwrap()), Some(2));
        assert_eq!(epc_of(&queue.recv().await.unwrap()), Some(3));
    }

    #[tokio::test]
    async fn test_overflow_never_drops_control_events() {
        let queue = EventQueue::new(2);
        queue.push(ack());
        queue.push(edge());

        // No read to evict: the incoming read goes.
        assert!(!queue.push(read(1)));
        assert_eq!(queue.dropped(), 1);

        // Control events still get in, past capacity.
        assert!(queue.push(ack()));
        assert_eq!(queue.len(), 3);

        let mut kinds = Vec::new();
        queue.close();
        while let Some(event) = queue.recv().await {
            kinds.push(event.message.type_name());
        }
        assert_eq!(kinds, vec!["command_ack", "sensor_edge", "command_ack"]);
    }

    #[tokio::test]
    async fn test_dropped_counter_is_monotonic() {
        let queue = EventQueue::new(1);
        let mut last = 0;
        for n in 0..20 {
            queue.push(read(n));
            let now = queue.dropped();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 19);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_receiver() {
        let queue = std::sync::Arc::new(EventQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }
}
