//! A single-threaded queue with explicit flow control.
//!
//! Producers [`push`](BufferedStream::push) items and learn from the return
//! value whether the consumer has fallen behind. Consumers
//! [`pull`](BufferedStream::pull) items while the stream is flowing. Nothing
//! is ever dropped: pausing only stops delivery.

use std::collections::VecDeque;

/// A FIFO of items with pause/resume and backpressure signalling.
#[derive(Debug)]
pub struct BufferedStream<T> {
    queue: VecDeque<T>,
    paused: bool,
    ended: bool,
}

impl<T> Default for BufferedStream<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            paused: false,
            ended: false,
        }
    }
}

impl<T> BufferedStream<T> {
    /// Create an empty, flowing stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an item.
    ///
    /// Returns `false` if the consumer must drain the stream before the
    /// producer pushes more: the stream is paused or an earlier item is
    /// still waiting.
    pub fn push(&mut self, item: T) -> bool {
        debug_assert!(!self.ended, "push after end");
        self.queue.push_back(item);
        !self.paused && self.queue.len() == 1
    }

    /// Take the next item, unless paused or empty.
    pub fn pull(&mut self) -> Option<T> {
        if self.paused {
            return None;
        }
        self.queue.pop_front()
    }

    /// Whether a producer may push without building up a backlog.
    #[must_use]
    pub fn writable(&self) -> bool {
        !self.paused && self.queue.is_empty()
    }

    /// Stop delivering items.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume delivering items.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether delivery is stopped.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Mark that nothing more will be pushed.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Whether the stream has ended and every item has been pulled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended && self.queue.is_empty()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Iterator for BufferedStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pull()
    }
}
