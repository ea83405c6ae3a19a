//! Bounded SPSC staging rings for the threaded packet path.
//!
//! Two rings decouple the event thread from blocking system calls: verdict
//! slots feed the netlink dispatcher thread, response-header slots feed the
//! upstream forwarder thread. Each ring is single-producer single-consumer
//! and strictly FIFO, which is what keeps verdicts in kernel-delivery order.
//!
//! `put` blocks while the ring is full. That is the flow control: the event
//! thread stops reading packets from the kernel queue until a consumer
//! drains a slot.

use std::sync::{Condvar, Mutex};

use crate::packet::Verdict;

/// One queued verdict awaiting the netlink dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct VerdictSlot {
    pub packet_id: u64,
    pub verdict: Verdict,
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    /// Free-running 64-bit counters; `counter & mask` is the slot index.
    /// Invariants: `write >= read` and `write - read <= capacity`.
    read: u64,
    write: u64,
}

pub struct StagingPool<T> {
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: u64,
    mask: u64,
}

impl<T> StagingPool<T> {
    /// `capacity` is rounded up to a power of two (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(1);
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                read: 0,
                write: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity: cap as u64,
            mask: (cap - 1) as u64,
        }
    }

    /// Enqueue, blocking while the ring is full.
    pub fn put(&self, item: T) {
        let mut ring = self.ring.lock().unwrap();
        if ring.write - ring.read >= self.capacity {
            tracing::warn!("staging pool full ({} slots), producer blocked", self.capacity);
            while ring.write - ring.read >= self.capacity {
                ring = self.not_full.wait(ring).unwrap();
            }
        }
        let idx = (ring.write & self.mask) as usize;
        ring.slots[idx] = Some(item);
        ring.write += 1;
        self.not_empty.notify_one();
    }

    /// Dequeue, blocking while the ring is empty.
    pub fn get(&self) -> T {
        let mut ring = self.ring.lock().unwrap();
        while ring.read >= ring.write {
            ring = self.not_empty.wait(ring).unwrap();
        }
        let idx = (ring.read & self.mask) as usize;
        let item = ring.slots[idx].take().expect("slot written by producer");
        ring.read += 1;
        self.not_full.notify_one();
        item
    }

    /// Slots currently queued.
    pub fn occupancy(&self) -> u64 {
        let ring = self.ring.lock().unwrap();
        ring.write - ring.read
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(StagingPool::<u32>::new(1).capacity(), 1);
        assert_eq!(StagingPool::<u32>::new(7).capacity(), 8);
        assert_eq!(StagingPool::<u32>::new(8).capacity(), 8);
    }

    #[test]
    fn test_fifo_within_capacity() {
        let pool = StagingPool::new(8);
        for i in 0..8u32 {
            pool.put(i);
        }
        assert_eq!(pool.occupancy(), 8);
        for i in 0..8u32 {
            assert_eq!(pool.get(), i);
        }
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn test_counters_wrap_through_the_mask() {
        let pool = StagingPool::new(4);
        // Cycle well past one lap of the ring.
        for i in 0..1000u32 {
            pool.put(i);
            assert_eq!(pool.get(), i);
        }
    }

    #[test]
    fn test_capacity_one_degenerates_to_lock_step() {
        let pool = Arc::new(StagingPool::new(1));
        let consumer = {
            let pool = pool.clone();
            thread::spawn(move || (0..100u32).map(|_| pool.get()).collect::<Vec<_>>())
        };
        for i in 0..100u32 {
            pool.put(i);
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_ring_blocks_the_producer() {
        let pool = Arc::new(StagingPool::new(8));
        for i in 0..8u32 {
            pool.put(i);
        }

        let producer = {
            let pool = pool.clone();
            thread::spawn(move || pool.put(8))
        };

        // The ninth put must not land while the consumer is parked.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.occupancy(), 8);
        assert!(!producer.is_finished());

        assert_eq!(pool.get(), 0);
        producer.join().unwrap();
        for i in 1..=8u32 {
            assert_eq!(pool.get(), i);
        }
    }

    #[test]
    fn test_concurrent_order_preserved() {
        let pool = Arc::new(StagingPool::new(64));
        let consumer = {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut prev = 0u64;
                for _ in 0..10_000 {
                    let slot: VerdictSlot = pool.get();
                    assert!(slot.packet_id > prev, "verdicts reordered");
                    prev = slot.packet_id;
                }
                prev
            })
        };
        for id in 1..=10_000u64 {
            pool.put(VerdictSlot {
                packet_id: id,
                verdict: Verdict::Drop,
            });
        }
        assert_eq!(consumer.join().unwrap(), 10_000);
    }
}
