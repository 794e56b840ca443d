use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

/// Bounded FIFO where a push into a full queue evicts the oldest entry.
pub struct FifoDropOldestQueue<T> {
    inner: Arc<FifoDropOldestInner<T>>,
}

struct FifoDropOldestInner<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

pub struct FifoDropOldestReceiver<T> {
    inner: Arc<FifoDropOldestInner<T>>,
}

impl<T> FifoDropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            inner: Arc::new(FifoDropOldestInner {
                buf: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
            }),
        }
    }

    /// Returns true when an older entry had to be dropped.
    pub fn push_overwrite(&self, value: T) -> bool {
        let mut buf = self.inner.buf.lock().expect("FifoDropOldestQueue poisoned");
        let dropped = if buf.len() >= self.inner.capacity {
            buf.pop_front().is_some()
        } else {
            false
        };
        buf.push_back(value);
        drop(buf);
        self.inner.notify.notify_one();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner
            .buf
            .lock()
            .expect("FifoDropOldestQueue poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn receiver(&self) -> FifoDropOldestReceiver<T> {
        FifoDropOldestReceiver {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FifoDropOldestReceiver<T> {
    pub fn try_recv(&self) -> Option<T> {
        self.inner
            .buf
            .lock()
            .expect("FifoDropOldestQueue poisoned")
            .pop_front()
    }

    /// Waits for the next entry.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.try_recv() {
                return value;
            }
            self.inner.notify.notified().await;
        }
    }
}
