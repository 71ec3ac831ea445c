/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;

use log::debug;

use crate::event::Event;

/// The inter-engine interface: anything that can take an event. Neighbours
/// and sessions hold these; the queue behind it belongs to exactly one
/// engine worker.
#[derive(Clone)]
pub struct EngineSender {
    name: &'static str,
    tx: Option<flume::Sender<Event>>,
}

impl EngineSender {
    pub fn new(name: &'static str, tx: flume::Sender<Event>) -> EngineSender {
        EngineSender { name, tx: Some(tx) }
    }

    /// A sender that discards everything; used before an engine is wired up
    /// and in tests.
    pub fn null(name: &'static str) -> EngineSender {
        EngineSender { name, tx: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an event to the engine's queue. A torn-down engine drops the
    /// event, which releases any session reference it carried.
    pub fn pass_event(&self, ev: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.send(ev) {
            debug!("engine {} is gone, dropping {:?}", self.name, e.into_inner());
        }
    }
}

impl fmt::Debug for EngineSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineSender({})", self.name)
    }
}

/// An engine's event queue, created before the engine itself so neighbours
/// can be wired in any order despite the pipeline's cycles.
pub struct EngineQueue {
    pub(crate) name: &'static str,
    pub(crate) tx: flume::Sender<Event>,
    pub(crate) rx: flume::Receiver<Event>,
}

impl EngineQueue {
    pub fn new(name: &'static str) -> EngineQueue {
        let (tx, rx) = flume::unbounded();
        EngineQueue { name, tx, rx }
    }

    pub fn sender(&self) -> EngineSender {
        EngineSender::new(self.name, self.tx.clone())
    }

    /// Consume the queue, leaving the receiving end for the engine worker.
    pub fn into_receiver(self) -> flume::Receiver<Event> {
        self.rx
    }
}
