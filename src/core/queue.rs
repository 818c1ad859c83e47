//! Purpose: Unbounded blocking FIFO connecting the reader loop to the delivery loop.
//! Exports: `MessageQueue`, `Entry`, `RecordQueue`, `SEGMENT_LEN`.
//! Role: The only state shared between the two execution contexts.
//! Invariants: Storage is a chain of fixed-size segments; queued items are never moved.
//! Invariants: `unpop` restores an item as the next one `pop` returns.
//! Invariants: Critical sections only touch cursors and segment links, never I/O.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::record::Record;
use crate::core::shutdown::ShutdownToken;

pub const SEGMENT_LEN: usize = 1000;

// Upper bound on how long a cancelled waiter can stay blocked.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// What flows through the relay queue: records, then a single end marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    Record(Record),
    EndOfInput,
}

pub type RecordQueue = MessageQueue<Entry>;

struct Segment<T> {
    slots: Box<[Option<T>]>,
}

impl<T> Segment<T> {
    fn new() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(SEGMENT_LEN).collect(),
        }
    }
}

struct Chain<T> {
    segments: VecDeque<Segment<T>>,
    // Read cursor inside the front segment.
    head: usize,
    // Write cursor inside the back segment.
    tail: usize,
    len: usize,
}

impl<T> Chain<T> {
    fn new() -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::new());
        Self {
            segments,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, item: T) {
        let tail = self.tail;
        if let Some(segment) = self.segments.back_mut() {
            segment.slots[tail] = Some(item);
        }
        self.tail += 1;
        if self.tail == SEGMENT_LEN {
            self.segments.push_back(Segment::new());
            self.tail = 0;
        }
        self.len += 1;
    }

    fn push_front(&mut self, item: T) {
        if self.head == 0 {
            self.segments.push_front(Segment::new());
            self.head = SEGMENT_LEN;
        }
        self.head -= 1;
        let head = self.head;
        if let Some(segment) = self.segments.front_mut() {
            segment.slots[head] = Some(item);
        }
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let head = self.head;
        let item = self
            .segments
            .front_mut()
            .and_then(|segment| segment.slots[head].take());
        self.head += 1;
        if self.head == SEGMENT_LEN {
            self.segments.pop_front();
            self.head = 0;
        }
        self.len -= 1;
        item
    }
}

pub struct MessageQueue<T> {
    chain: Mutex<Chain<T>>,
    ready: Condvar,
    // Mirror of `chain.len` readable without taking the lock.
    len: AtomicUsize,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(Chain::new()),
            ready: Condvar::new(),
            len: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Chain<T>> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        {
            let mut chain = self.lock();
            chain.push_back(item);
            self.len.store(chain.len, Ordering::Release);
        }
        self.ready.notify_one();
    }

    /// Puts an item back at the front so it is the next one popped.
    pub fn unpop(&self, item: T) {
        {
            let mut chain = self.lock();
            chain.push_front(item);
            self.len.store(chain.len, Ordering::Release);
        }
        self.ready.notify_one();
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> T {
        let mut chain = self.lock();
        loop {
            if let Some(item) = self.take(&mut chain) {
                return item;
            }
            chain = self
                .ready
                .wait(chain)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `pop`, but gives up with `None` once `token` is cancelled. The
    /// token is checked on entry and after every wakeup; the lock is released
    /// while waiting.
    pub fn pop_cancellable(&self, token: &ShutdownToken) -> Option<T> {
        if token.is_cancelled() {
            return None;
        }
        let mut chain = self.lock();
        loop {
            if let Some(item) = self.take(&mut chain) {
                return Some(item);
            }
            if token.is_cancelled() {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(chain, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            chain = guard;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut chain = self.lock();
        self.take(&mut chain)
    }

    /// Best-effort count of queued items; only good for bounding drain loops.
    pub fn size(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn take(&self, chain: &mut Chain<T>) -> Option<T> {
        let item = chain.pop_front()?;
        self.len.store(chain.len, Ordering::Release);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageQueue, SEGMENT_LEN};
    use crate::core::shutdown::ShutdownToken;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn pop_order_matches_push_order_across_segments() {
        let queue = MessageQueue::new();
        let total = SEGMENT_LEN * 2 + 17;
        for i in 0..total {
            queue.push(i);
        }
        assert_eq!(queue.size(), total);
        for i in 0..total {
            assert_eq!(queue.pop(), i);
        }
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn unpop_is_observed_next() {
        let queue = MessageQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        let first = queue.pop();
        assert_eq!(first, 1);
        queue.unpop(first);
        queue.push(4);
        let observed: Vec<_> = (0..4).map(|_| queue.pop()).collect();
        assert_eq!(observed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unpop_into_empty_queue_then_push() {
        let queue = MessageQueue::new();
        queue.unpop("a");
        queue.unpop("b");
        queue.push("c");
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.pop(), "b");
        assert_eq!(queue.pop(), "a");
        assert_eq!(queue.pop(), "c");
    }

    #[test]
    fn unpop_at_segment_boundary() {
        let queue = MessageQueue::new();
        for i in 0..SEGMENT_LEN + 2 {
            queue.push(i);
        }
        for i in 0..SEGMENT_LEN {
            assert_eq!(queue.pop(), i);
        }
        queue.unpop(SEGMENT_LEN - 1);
        assert_eq!(queue.pop(), SEGMENT_LEN - 1);
        assert_eq!(queue.pop(), SEGMENT_LEN);
        assert_eq!(queue.pop(), SEGMENT_LEN + 1);
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(42u32);
        assert_eq!(consumer.join().expect("join"), 42);
    }

    #[test]
    fn cancelled_pop_returns_promptly_and_releases_lock() {
        let queue = Arc::new(MessageQueue::<u32>::new());
        let token = ShutdownToken::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            thread::spawn(move || queue.pop_cancellable(&token))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        token.cancel();
        assert_eq!(waiter.join().expect("join"), None);
        assert!(started.elapsed() < Duration::from_secs(2));

        queue.push(7);
        assert_eq!(queue.try_pop(), Some(7));
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(MessageQueue::new());
        let producers: Vec<_> = (0..3u32)
            .map(|id| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..500u32 {
                        queue.push((id, seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("join");
        }

        let mut next = [0u32; 3];
        for _ in 0..1500 {
            let (id, seq) = queue.pop();
            assert_eq!(seq, next[id as usize]);
            next[id as usize] += 1;
        }
    }
}
