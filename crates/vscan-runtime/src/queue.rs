//! Inter-thread work handoff.
//!
//! A thin wrapper over an MPMC channel: blocking pop, non-blocking push,
//! `len()` as a racy lower bound for the allocator's backlog heuristics.
//! FIFO per producer. Termination flows in-band as sentinel entries, never
//! by closing the channel; a closed channel therefore means a peer died and
//! is surfaced to the caller.

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue closed: all peers exited")]
pub struct QueueClosed;

#[derive(Debug)]
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, value: T) -> Result<(), QueueClosed> {
        self.tx.send(value).map_err(|_| QueueClosed)
    }

    /// Blocks while empty. `None` means every peer holding the sending side
    /// has exited without a sentinel, which the protocol treats as fatal.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Racy lower bound; good enough for throttling decisions.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fifo_per_producer() {
        let q = WorkQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = WorkQueue::new();
        let q2 = q.clone();
        let popper = std::thread::spawn(move || q2.pop());
        std::thread::sleep(Duration::from_millis(20));
        q.push(42u32).unwrap();
        assert_eq!(popper.join().unwrap(), Some(42));
    }

    #[test]
    fn sentinel_values_flow_through_unchanged() {
        let q = WorkQueue::new();
        q.push(crate::LoadWork::Item(7)).unwrap();
        q.push(crate::LoadWork::Stop).unwrap();
        assert!(matches!(q.pop(), Some(crate::LoadWork::Item(7))));
        assert!(matches!(q.pop(), Some(crate::LoadWork::Stop)));
    }
}
