//! Timed-Command Queue
//!
//! Bounded single-producer/single-consumer FIFO of [`TimedCommand`]s handed
//! from the link handler to the control loop.
//!
//! - [`Producer`] - write end, owned by the link handler
//! - [`Consumer`] - read end, owned by the control loop
//!
//! Every operation is wait-free apart from a retry in `peek` that only spins
//! while the producer is flushing. Slots hold a packed `u64`, so a slot that is
//! rewritten after a flush is never observed torn.
//!
//! Indices grow monotonically:
//! - `tail` is the next slot to write, advanced only by the producer.
//! - `head` is the next slot to read. The consumer advances it by one with a
//!   compare-exchange; the producer's [`Producer::clear`] jumps it to `tail`.
//!   A pop that races with a clear fails its compare-exchange and drops nothing
//!   new.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::TimedCommand;

/// Returned by [`Producer::push`] when the queue is at capacity
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timed command queue full, rejected {0:?}")]
pub struct QueueFull(pub TimedCommand);

struct Shared<const N: usize> {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: [AtomicU64; N],
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "Queue capacity must be greater than 0");
}

/// Create a queue holding at most `N` commands
pub fn channel<const N: usize>() -> (Producer<N>, Consumer<N>) {
    #[allow(clippy::let_unit_value)]
    let _ = CapacityCheck::<N>::OK;

    let shared = Arc::new(Shared {
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        slots: std::array::from_fn(|_| AtomicU64::new(0)),
    });
    (
        Producer {
            shared: shared.clone(),
            _unsync: PhantomData,
        },
        Consumer {
            shared,
            peeked: None,
            _unsync: PhantomData,
        },
    )
}

/// Write end of the queue
///
/// `Send` but not `Sync`, and not `Clone`: ownership is what guarantees a
/// single producer.
pub struct Producer<const N: usize> {
    shared: Arc<Shared<N>>,
    _unsync: PhantomUnsync,
}

impl<const N: usize> Producer<N> {
    /// Append a command, failing immediately when full
    pub fn push(&mut self, command: TimedCommand) -> Result<(), QueueFull> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            return Err(QueueFull(command));
        }
        self.shared.slots[tail % N].store(command.pack(), Ordering::Release);
        self.shared.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Drop every queued command, including one the consumer has peeked
    pub fn clear(&mut self) {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        self.shared.head.store(tail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        len(&self.shared)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[derive(Debug, Clone, Copy)]
struct Peeked {
    index: usize,
    command: TimedCommand,
}

/// Read end of the queue
///
/// Remembers the last peeked item, so repeated peeks across control-loop ticks
/// cost a single atomic load until the item is popped or flushed.
pub struct Consumer<const N: usize> {
    shared: Arc<Shared<N>>,
    peeked: Option<Peeked>,
    _unsync: PhantomUnsync,
}

impl<const N: usize> Consumer<N> {
    /// Look at the head without removing it
    pub fn peek(&mut self) -> Option<TimedCommand> {
        if let Some(peeked) = self.peeked {
            if self.shared.head.load(Ordering::Acquire) == peeked.index {
                return Some(peeked.command);
            }
            // Flushed by the producer
            self.peeked = None;
        }

        loop {
            let head = self.shared.head.load(Ordering::Acquire);
            let tail = self.shared.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let raw = self.shared.slots[head % N].load(Ordering::Acquire);
            if self.shared.head.load(Ordering::Acquire) != head {
                continue;
            }
            let command = TimedCommand::unpack(raw);
            self.peeked = Some(Peeked {
                index: head,
                command,
            });
            return Some(command);
        }
    }

    /// Remove the peeked item (peeking first if needed)
    ///
    /// Returns `None` if the queue is empty or the item was flushed in between.
    pub fn pop(&mut self) -> Option<TimedCommand> {
        if self.peeked.is_none() {
            self.peek()?;
        }
        let peeked = self.peeked.take()?;
        self.shared
            .head
            .compare_exchange(
                peeked.index,
                peeked.index.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| peeked.command)
    }

    pub fn len(&self) -> usize {
        len(&self.shared)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn len<const N: usize>(shared: &Shared<N>) -> usize {
    let head = shared.head.load(Ordering::Acquire);
    let tail = shared.tail.load(Ordering::Acquire);
    tail.wrapping_sub(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    fn cmd(action: Action, target: u32) -> TimedCommand {
        TimedCommand::new(action, target)
    }

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = channel::<4>();
        tx.push(cmd(Action::LedOn, 1)).unwrap();
        tx.push(cmd(Action::LedOff, 2)).unwrap();

        assert_eq!(rx.pop(), Some(cmd(Action::LedOn, 1)));
        assert_eq!(rx.pop(), Some(cmd(Action::LedOff, 2)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_full_queue_keeps_items() {
        let (mut tx, mut rx) = channel::<4>();
        for t in 0..4 {
            tx.push(cmd(Action::DriveForward, t)).unwrap();
        }

        let rejected = cmd(Action::DriveBackward, 99);
        assert_eq!(tx.push(rejected), Err(QueueFull(rejected)));
        assert_eq!(tx.len(), 4);

        for t in 0..4 {
            assert_eq!(rx.pop(), Some(cmd(Action::DriveForward, t)));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let (mut tx, mut rx) = channel::<2>();
        assert_eq!(rx.peek(), None);

        tx.push(cmd(Action::Go, 5)).unwrap();
        assert_eq!(rx.peek(), Some(cmd(Action::Go, 5)));
        assert_eq!(rx.peek(), Some(cmd(Action::Go, 5)));
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.pop(), Some(cmd(Action::Go, 5)));
        assert_eq!(rx.peek(), None);
    }

    #[test]
    fn test_clear_invalidates_peeked_item() {
        let (mut tx, mut rx) = channel::<4>();
        tx.push(cmd(Action::DriveLeft, 100)).unwrap();
        assert_eq!(rx.peek(), Some(cmd(Action::DriveLeft, 100)));

        tx.clear();
        tx.push(cmd(Action::Disconnect, 7)).unwrap();

        // The stale peek must not come back
        assert_eq!(rx.peek(), Some(cmd(Action::Disconnect, 7)));
        assert_eq!(rx.pop(), Some(cmd(Action::Disconnect, 7)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_clear_frees_capacity() {
        let (mut tx, mut rx) = channel::<2>();
        tx.push(cmd(Action::LedOn, 1)).unwrap();
        tx.push(cmd(Action::LedOn, 2)).unwrap();
        assert!(tx.push(cmd(Action::LedOn, 3)).is_err());

        tx.clear();
        assert!(tx.is_empty());
        tx.push(cmd(Action::LedOff, 4)).unwrap();
        tx.push(cmd(Action::LedOff, 5)).unwrap();
        assert_eq!(rx.pop(), Some(cmd(Action::LedOff, 4)));
    }

    #[test]
    fn test_wraps_around_ring() {
        let (mut tx, mut rx) = channel::<3>();
        for t in 0..50 {
            tx.push(cmd(Action::DriveZero, t)).unwrap();
            assert_eq!(rx.pop(), Some(cmd(Action::DriveZero, t)));
        }
    }

    #[test]
    fn test_cross_thread_fifo() {
        const COUNT: u32 = 20_000;
        let (mut tx, mut rx) = channel::<4>();

        let producer = std::thread::spawn(move || {
            let mut next = 0;
            while next < COUNT {
                if tx.push(cmd(Action::DriveForward, next)).is_ok() {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match rx.pop() {
                Some(c) => {
                    assert_eq!(c.target_time, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_flush_never_yields_flushed_items() {
        // Producer repeatedly fills with "stale" commands, flushes, then pushes a marker.
        // The consumer may see stale items before a flush, but never after it saw
        // the marker that followed that flush.
        const ROUNDS: u32 = 5_000;
        let (mut tx, mut rx) = channel::<4>();

        let producer = std::thread::spawn(move || {
            for round in 0..ROUNDS {
                let _ = tx.push(cmd(Action::DriveLeft, round));
                let _ = tx.push(cmd(Action::DriveRight, round));
                tx.clear();
                while tx.push(cmd(Action::Disconnect, round)).is_err() {
                    std::thread::yield_now();
                }
            }
        });

        let mut last_marker: Option<u32> = None;
        loop {
            match rx.pop() {
                Some(c) if c.action == Action::Disconnect => {
                    if let Some(prev) = last_marker {
                        assert!(c.target_time > prev);
                    }
                    last_marker = Some(c.target_time);
                    if c.target_time == ROUNDS - 1 {
                        break;
                    }
                }
                Some(c) => {
                    // A stale item must belong to a round after the last marker seen
                    if let Some(prev) = last_marker {
                        assert!(c.target_time > prev);
                    }
                }
                None => {
                    if producer.is_finished() && rx.is_empty() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        producer.join().unwrap();
    }
}
