use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// Creates a bounded lock-free single-producer/single-consumer funnel.
/// Interrupt-time input (UART bytes, ticks) is pushed on the producer side
/// and drained by the main loop between tasks; nothing ever blocks on it.
pub fn funnel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(ArrayQueue::new(capacity));

    (
        Producer {
            queue: queue.clone(),
        },
        Consumer { queue },
    )
}

pub struct Producer<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Producer<T> {
    /// Push a value, handing it back when the queue is full so the caller
    /// can count the overflow.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push(value)
    }
}

pub struct Consumer<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Consumer<T> {
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
