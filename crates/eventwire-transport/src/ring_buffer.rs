use crate::error::RingBufferError;
use crate::utils::CancellationToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What a full buffer does with the next push.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head to make room for the new item.
    DropOldest,
    /// Refuse the new item.
    DropNewest,
    /// Wait for a consumer to make room.
    Block,
    /// Double the capacity and store the item.
    Resize,
}

/// Result of a push, describing how the overflow policy resolved it.
#[derive(Debug)]
pub enum PushOutcome<T> {
    /// Stored without conflict.
    Stored,
    /// Stored after evicting the returned head item (DropOldest).
    Evicted(T),
    /// Refused; the item is handed back (DropNewest, or a zero-capacity
    /// buffer under any policy that cannot grow).
    Rejected(T),
    /// Stored after growing to the returned capacity (Resize).
    Grew(usize),
}

impl<T> PushOutcome<T> {
    pub fn stored(&self) -> bool {
        matches!(
            self,
            PushOutcome::Stored | PushOutcome::Evicted(_) | PushOutcome::Grew(_)
        )
    }
}

/// Counter snapshot; timing averages are exponential moving averages of the
/// time spent inside the buffer's critical section.
#[derive(Debug, Clone, Default)]
pub struct RingBufferMetrics {
    pub pushes: u64,
    pub pops: u64,
    pub dropped: u64,
    pub avg_push_time: Duration,
    pub avg_pop_time: Duration,
}

const EMA_ALPHA: f64 = 0.1;

#[derive(Default)]
struct Timings {
    push_ns: f64,
    pop_ns: f64,
}

impl Timings {
    fn sample(current: f64, elapsed: Duration) -> f64 {
        let observed = elapsed.as_nanos() as f64;
        if current == 0.0 {
            observed
        } else {
            current + EMA_ALPHA * (observed - current)
        }
    }
}

/// Fixed-capacity slot storage. `head`/`tail` advance modulo capacity;
/// `len == 0` is empty, `len == capacity` is full. A popped slot is
/// `take()`n so the buffer never retains ownership of delivered items.
struct Slots<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
    closed: bool,
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            len: 0,
            closed: false,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn store(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    fn grow(&mut self) {
        let old_capacity = self.capacity();
        let new_capacity = (old_capacity * 2).max(1);
        let mut slots: Vec<Option<T>> = (0..new_capacity).map(|_| None).collect();
        for (i, slot) in slots.iter_mut().take(self.len).enumerate() {
            *slot = self.slots[(self.head + i) % old_capacity].take();
        }
        self.slots = slots;
        self.head = 0;
        self.tail = self.len;
    }
}

/// Thread-safe bounded FIFO with pluggable overflow behavior.
///
/// Blocking operations use two wakers, `not_empty` and `not_full`, re-checking
/// their predicate after every wakeup: a wake from `close`'s broadcast, or a
/// spurious one, must never be mistaken for progress. Every wait can also be
/// raced against a cancellation token via [`push`](Self::push) /
/// [`pop`](Self::pop).
pub struct RingBuffer<T> {
    policy: OverflowPolicy,
    inner: Mutex<Slots<T>>,
    not_empty: Notify,
    not_full: Notify,
    pushes: AtomicU64,
    pops: AtomicU64,
    dropped: AtomicU64,
    timings: Mutex<Timings>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Slots::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timings: Mutex::new(Timings::default()),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Non-blocking push. Under `Block` a full buffer rejects instead of
    /// waiting.
    pub fn try_push(&self, item: T) -> Result<PushOutcome<T>, RingBufferError> {
        let started = Instant::now();
        let mut slots = self.inner.lock();
        if slots.closed {
            return Err(RingBufferError::Closed);
        }
        if !slots.is_full() {
            slots.store(item);
            drop(slots);
            self.record_push(started);
            self.not_empty.notify_one();
            return Ok(PushOutcome::Stored);
        }
        match self.policy {
            OverflowPolicy::DropOldest => match slots.pop_front() {
                Some(evicted) => {
                    slots.store(item);
                    drop(slots);
                    self.record_push(started);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    Ok(PushOutcome::Evicted(evicted))
                }
                // zero capacity: nothing to evict, nowhere to store
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(PushOutcome::Rejected(item))
                }
            },
            OverflowPolicy::DropNewest | OverflowPolicy::Block => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(PushOutcome::Rejected(item))
            }
            OverflowPolicy::Resize => {
                slots.grow();
                slots.store(item);
                let capacity = slots.capacity();
                drop(slots);
                self.record_push(started);
                self.not_empty.notify_one();
                Ok(PushOutcome::Grew(capacity))
            }
        }
    }

    /// Push that waits for room under `Block`, releasing only on success,
    /// close, or (via [`push`](Self::push)) cancellation.
    pub async fn push_wait(&self, item: T) -> Result<PushOutcome<T>, RingBufferError> {
        loop {
            {
                let started = Instant::now();
                let mut slots = self.inner.lock();
                if slots.closed {
                    return Err(RingBufferError::Closed);
                }
                if !slots.is_full() {
                    slots.store(item);
                    drop(slots);
                    self.record_push(started);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Stored);
                }
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        return match slots.pop_front() {
                            Some(evicted) => {
                                slots.store(item);
                                drop(slots);
                                self.record_push(started);
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                self.not_empty.notify_one();
                                Ok(PushOutcome::Evicted(evicted))
                            }
                            None => {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                Ok(PushOutcome::Rejected(item))
                            }
                        };
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(PushOutcome::Rejected(item));
                    }
                    OverflowPolicy::Resize => {
                        slots.grow();
                        slots.store(item);
                        let capacity = slots.capacity();
                        drop(slots);
                        self.record_push(started);
                        self.not_empty.notify_one();
                        return Ok(PushOutcome::Grew(capacity));
                    }
                    OverflowPolicy::Block => {
                        // a zero-capacity buffer can never make room
                        if slots.capacity() == 0 {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            return Ok(PushOutcome::Rejected(item));
                        }
                        // fall through to wait with the item retained
                    }
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Blocking push raced against a cancellation token. A cancelled wait
    /// drops the item and returns [`RingBufferError::Cancelled`].
    pub async fn push(
        &self,
        item: T,
        token: &CancellationToken,
    ) -> Result<PushOutcome<T>, RingBufferError> {
        tokio::select! {
            result = self.push_wait(item) => result,
            _ = token.cancelled() => Err(RingBufferError::Cancelled),
        }
    }

    /// Non-blocking removal of the head.
    pub fn try_pop(&self) -> Option<T> {
        let started = Instant::now();
        let mut slots = self.inner.lock();
        let item = slots.pop_front()?;
        drop(slots);
        self.record_pop(started);
        self.not_full.notify_one();
        Some(item)
    }

    /// Pop that waits while the buffer is empty. A closed buffer keeps
    /// yielding buffered items until drained, then returns `Closed`. That
    /// ordering is what lets consumers drain on shutdown.
    pub async fn pop_wait(&self) -> Result<T, RingBufferError> {
        loop {
            {
                let started = Instant::now();
                let mut slots = self.inner.lock();
                if let Some(item) = slots.pop_front() {
                    drop(slots);
                    self.record_pop(started);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if slots.closed {
                    return Err(RingBufferError::Closed);
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Blocking pop raced against a cancellation token.
    pub async fn pop(&self, token: &CancellationToken) -> Result<T, RingBufferError> {
        tokio::select! {
            result = self.pop_wait() => result,
            _ = token.cancelled() => Err(RingBufferError::Cancelled),
        }
    }

    /// Atomically empties the buffer, returning the items in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let mut slots = self.inner.lock();
        let mut items = Vec::with_capacity(slots.len);
        while let Some(item) = slots.pop_front() {
            items.push(item);
        }
        drop(slots);
        self.pops.fetch_add(items.len() as u64, Ordering::Relaxed);
        self.not_full.notify_waiters();
        items
    }

    /// Empties the buffer, discarding the items.
    pub fn clear(&self) {
        drop(self.drain());
    }

    /// Closes the buffer and broadcasts to every waiter. Blocked pushers see
    /// `Closed` immediately; poppers drain the remaining items first.
    pub fn close(&self) {
        {
            let mut slots = self.inner.lock();
            slots.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn metrics(&self) -> RingBufferMetrics {
        let timings = self.timings.lock();
        RingBufferMetrics {
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            avg_push_time: Duration::from_nanos(timings.push_ns as u64),
            avg_pop_time: Duration::from_nanos(timings.pop_ns as u64),
        }
    }

    fn record_push(&self, started: Instant) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let mut timings = self.timings.lock();
        timings.push_ns = Timings::sample(timings.push_ns, started.elapsed());
    }

    fn record_pop(&self, started: Instant) {
        self.pops.fetch_add(1, Ordering::Relaxed);
        let mut timings = self.timings.lock();
        timings.pop_ns = Timings::sample(timings.pop_ns, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::CancellationTokenSource;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[test]
    fn fifo_order_preserved() {
        let buffer = RingBuffer::new(4, OverflowPolicy::Block);
        for i in 0..4 {
            assert!(buffer.try_push(i).unwrap().stored());
        }
        assert!(buffer.is_full());
        for i in 0..4 {
            assert_eq!(buffer.try_pop(), Some(i));
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn drop_oldest_keeps_tail_of_sequence() {
        let buffer = RingBuffer::new(3, OverflowPolicy::DropOldest);
        for i in 1..=5 {
            let outcome = buffer.try_push(i).unwrap();
            assert!(outcome.stored());
        }
        assert_eq!(buffer.drain(), vec![3, 4, 5]);
        assert_eq!(buffer.metrics().dropped, 2);
    }

    #[test]
    fn drop_newest_keeps_head_of_sequence() {
        let buffer = RingBuffer::new(3, OverflowPolicy::DropNewest);
        for i in 1..=5 {
            buffer.try_push(i).unwrap();
        }
        assert_eq!(buffer.drain(), vec![1, 2, 3]);
        assert_eq!(buffer.metrics().dropped, 2);
    }

    #[test]
    fn resize_grows_and_keeps_order() {
        let buffer = RingBuffer::new(2, OverflowPolicy::Resize);
        buffer.try_push(1).unwrap();
        buffer.try_push(2).unwrap();
        match buffer.try_push(3).unwrap() {
            PushOutcome::Grew(capacity) => assert_eq!(capacity, 4),
            other => panic!("expected Grew, got {other:?}"),
        }
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(buffer.drain(), vec![1, 2, 3]);
    }

    #[test]
    fn resize_from_zero_capacity() {
        let buffer = RingBuffer::new(0, OverflowPolicy::Resize);
        buffer.try_push(7).unwrap();
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.try_pop(), Some(7));
    }

    #[test]
    fn zero_capacity_block_rejects() {
        let buffer = RingBuffer::new(0, OverflowPolicy::Block);
        match buffer.try_push(1).unwrap() {
            PushOutcome::Rejected(item) => assert_eq!(item, 1),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let buffer = Arc::new(RingBuffer::new(2, OverflowPolicy::Block));
        let reader = Arc::clone(&buffer);
        let handle = tokio::spawn(async move { reader.pop_wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.try_push(42).unwrap();

        let popped = timeout(Duration::from_millis(200), handle)
            .await
            .expect("pop should wake")
            .unwrap();
        assert_eq!(popped, Ok(42));
    }

    #[tokio::test]
    async fn blocked_push_wakes_on_pop() {
        let buffer = Arc::new(RingBuffer::new(1, OverflowPolicy::Block));
        buffer.try_push(1).unwrap();

        let writer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move { writer.push_wait(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(buffer.try_pop(), Some(1));

        let outcome = timeout(Duration::from_millis(200), handle)
            .await
            .expect("push should wake")
            .unwrap()
            .unwrap();
        assert!(outcome.stored());
        assert_eq!(buffer.try_pop(), Some(2));
    }

    #[tokio::test]
    async fn close_releases_waiters_and_drains() {
        let buffer: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(2, OverflowPolicy::Block));
        buffer.try_push(9).unwrap();

        let reader = Arc::clone(&buffer);
        let drained = tokio::spawn(async move {
            let first = reader.pop_wait().await;
            let second = reader.pop_wait().await;
            (first, second)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let (first, second) = timeout(Duration::from_millis(200), drained)
            .await
            .expect("close should release the waiter")
            .unwrap();
        assert_eq!(first, Ok(9));
        assert_eq!(second, Err(RingBufferError::Closed));
    }

    #[tokio::test]
    async fn close_releases_blocked_pusher() {
        let buffer = Arc::new(RingBuffer::new(1, OverflowPolicy::Block));
        buffer.try_push(1).unwrap();

        let writer = Arc::clone(&buffer);
        let handle = tokio::spawn(async move { writer.push_wait(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = timeout(Duration::from_millis(200), handle)
            .await
            .expect("close should release the pusher")
            .unwrap();
        assert!(matches!(result, Err(RingBufferError::Closed)));
    }

    #[tokio::test]
    async fn cancellation_releases_waiters() {
        let buffer: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(1, OverflowPolicy::Block));
        let (source, token) = CancellationTokenSource::new();

        let reader = Arc::clone(&buffer);
        let pop_handle = tokio::spawn(async move { reader.pop(&token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();

        let result = timeout(Duration::from_millis(200), pop_handle)
            .await
            .expect("cancel should release the waiter")
            .unwrap();
        assert_eq!(result, Err(RingBufferError::Cancelled));
    }

    #[test]
    fn drain_empties_and_wraps_correctly() {
        let buffer = RingBuffer::new(3, OverflowPolicy::DropOldest);
        // wrap the head past the end of the slot vector
        for i in 0..7 {
            buffer.try_push(i).unwrap();
        }
        assert_eq!(buffer.drain(), vec![4, 5, 6]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn metrics_count_operations() {
        let buffer = RingBuffer::new(2, OverflowPolicy::DropNewest);
        buffer.try_push(1).unwrap();
        buffer.try_push(2).unwrap();
        buffer.try_push(3).unwrap(); // rejected
        buffer.try_pop();

        let metrics = buffer.metrics();
        assert_eq!(metrics.pushes, 2);
        assert_eq!(metrics.pops, 1);
        assert_eq!(metrics.dropped, 1);
    }
}
