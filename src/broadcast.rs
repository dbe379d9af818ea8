//! Fan-out of text lines to a dynamic set of subscribers, with a bounded
//! ring buffer of recent lines so late subscribers can replay history.
//!
//! Producers never block: a subscriber whose channel buffer is full
//! simply misses the line. Each subscriber therefore sees an in-order
//! prefix-with-gaps of the broadcast sequence.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::consts;

#[derive(Debug)]
pub struct Broadcaster {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    history: VecDeque<String>,
    capacity: usize,
    subscribers: HashMap<u64, Sender<String>>,
    next_id: u64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(consts::DEFAULT_HISTORY_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Broadcaster {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(capacity),
                capacity,
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a new subscriber. The returned id must be handed back
    /// to `unsubscribe` when the consumer goes away.
    pub fn subscribe(&self) -> (u64, Receiver<String>) {
        // unwrap to propagate the poison as an unwind
        let mut inner = self.inner.lock().unwrap();
        inner.register()
    }

    /// Atomically register a subscriber and snapshot up to the last
    /// `n` lines of history. Lines broadcast after this call land on
    /// the channel, so the subscriber misses nothing in between.
    pub fn subscribe_with_history(&self, n: usize) -> (u64, Receiver<String>, Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        let skip = inner.history.len().saturating_sub(n);
        let snapshot = inner.history.iter().skip(skip).cloned().collect();
        let (id, rx) = inner.register();
        (id, rx, snapshot)
    }

    /// Remove a subscriber. Dropping the sender closes the channel, so
    /// the close happens exactly once; unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(&id);
    }

    /// Append a line to the ring and deliver it to every subscriber
    /// without blocking. Subscribers with a full buffer drop the line.
    pub fn broadcast(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.push_history(line);
        for tx in inner.subscribers.values() {
            let _ = tx.try_send(String::from(line));
        }
    }

    /// Append to the ring without delivering to subscribers. Used to
    /// seed history for replay on attach.
    pub fn add_to_history(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.push_history(line);
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Inner {
    fn register(&mut self) -> (u64, Receiver<String>) {
        let (tx, rx) = bounded(consts::SUBSCRIBER_BUFFER);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    fn push_history(&mut self, line: &str) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(String::from(line));
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
