//! Outbound scheduling: one FIFO per transfer, served round-robin so a
//! bulk transfer cannot starve the others sharing a connection.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug)]
pub struct OutboundScheduler<K, T> {
    queues: HashMap<K, VecDeque<T>>,
    /// Keys with queued items, in service order. Each key appears once.
    ready: VecDeque<K>,
    len: usize,
}

impl<K: Copy + Eq + Hash, T> Default for OutboundScheduler<K, T> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            ready: VecDeque::new(),
            len: 0,
        }
    }
}

impl<K: Copy + Eq + Hash, T> OutboundScheduler<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: K, item: T) {
        let queue = self.queues.entry(key).or_default();
        if queue.is_empty() {
            self.ready.push_back(key);
        }
        queue.push_back(item);
        self.len += 1;
    }

    /// Next item from the transfer whose turn it is.
    pub fn pop(&mut self) -> Option<(K, T)> {
        let key = self.ready.pop_front()?;
        let queue = self.queues.get_mut(&key)?;
        let item = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&key);
        } else {
            self.ready.push_back(key);
        }
        self.len -= 1;
        Some((key, item))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
