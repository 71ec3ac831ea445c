/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use crate::engine::EngineSender;
use crate::event::{Event, EventKind, Returner};

/// A fixed-size free list of events, backed by a bounded channel so the
/// socket engine's async tasks and the worker threads share one mechanism.
/// An empty pool is the pipeline's backpressure signal.
pub struct Pool {
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
    size: usize,
}

impl Pool {
    /// Create a pool of `size` events whose returner points at the owning
    /// engine's queue with the given `*Done` kind.
    pub fn new(size: usize, capacity: usize, owner: EngineSender, done_kind: EventKind) -> Pool {
        let (tx, rx) = flume::bounded(size);
        for _ in 0..size {
            let returner = Returner {
                owner: owner.clone(),
                done_kind,
            };
            tx.send(Event::pooled(capacity, returner))
                .expect("pool channel sized to hold all events");
        }
        Pool { tx, rx, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// How many events are home right now.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn is_full(&self) -> bool {
        self.rx.len() == self.size
    }

    /// Non-blocking acquire, for the engine worker threads.
    pub fn try_acquire(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Async acquire, for the socket engine's reader tasks.
    pub async fn acquire(&self) -> Option<Event> {
        self.rx.recv_async().await.ok()
    }

    /// Put a returned event back on the free list.
    pub fn release(&self, mut ev: Event) {
        ev.session = None;
        ev.buf.clear();
        if self.tx.try_send(ev).is_err() {
            // a pool can never overflow with its own events
            log::error!("event pool overflow");
        }
    }
}
