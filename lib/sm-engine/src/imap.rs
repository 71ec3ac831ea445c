/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use sm_types::Error;

use crate::engine::EngineSender;
use crate::event::{Event, EventKind};
use crate::pool::Pool;
use crate::session::{EngineId, RefReason, Session, SessionRef};
use crate::EVENT_BUF_SIZE;

/// Per-session controller logic, provided by the application. The engine
/// guarantees single-threaded, in-order delivery per session.
pub trait SessionLogic: Send {
    /// The session is live; emit any greeting.
    fn on_start(&mut self, out: &mut LogicOut);

    /// Decrypted bytes arrived from the TLS engine.
    fn on_read(&mut self, data: &[u8], out: &mut LogicOut) -> sm_types::Result<()>;

    /// The peer sent EOF.
    fn on_eof(&mut self, out: &mut LogicOut);
}

enum OutItem {
    Data(Arc<Session>, Vec<u8>),
    Action(Box<dyn FnOnce() + Send>),
}

/// Where controller logic puts its output: writes to any session
/// (typically its own, or its paired peer), ordered deferred actions, and
/// close requests.
#[derive(Default)]
pub struct LogicOut {
    items: Vec<OutItem>,
    closes: Vec<(Arc<Session>, Option<Error>)>,
}

impl LogicOut {
    pub fn write(&mut self, session: &Arc<Session>, data: &[u8]) {
        if !data.is_empty() {
            self.items.push(OutItem::Data(session.clone(), data.to_vec()));
        }
    }

    /// Run `f` after every write queued so far has been handed upstream;
    /// the STARTTLS upgrade uses this to order itself after its `OK`.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.items.push(OutItem::Action(Box::new(f)));
    }

    pub fn close(&mut self, session: &Arc<Session>, err: Option<Error>) {
        self.closes.push((session.clone(), err));
    }
}

struct ImapData {
    session: Arc<Session>,
    logic: Box<dyn SessionLogic>,
}

/// The most-downstream engine: hands plaintext to per-session controller
/// logic and turns the logic's output into `Write` events heading upstream.
pub struct ImapEngine {
    sender: EngineSender,
    prestart: Arc<Mutex<HashMap<u64, Box<dyn SessionLogic>>>>,
    join: Option<thread::JoinHandle<()>>,
}

impl ImapEngine {
    pub fn new(
        queue: crate::engine::EngineQueue,
        upstream: EngineSender,
        nwrite_events: usize,
    ) -> ImapEngine {
        let prestart: Arc<Mutex<HashMap<u64, Box<dyn SessionLogic>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sender = queue.sender();
        let worker = Worker {
            queue_rx: queue.into_receiver(),
            write_pool: Pool::new(
                nwrite_events,
                EVENT_BUF_SIZE,
                sender.clone(),
                EventKind::WriteDone,
            ),
            upstream,
            prestart: prestart.clone(),
            sessions: HashMap::new(),
            outbox: VecDeque::new(),
            quitting: false,
            quit_pending: false,
        };
        let join = thread::Builder::new()
            .name("imap-engine".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn imap engine thread");

        ImapEngine {
            sender,
            prestart,
            join: Some(join),
        }
    }

    pub fn sender(&self) -> EngineSender {
        self.sender.clone()
    }

    /// Attach controller logic and deliver the session's start event.
    pub fn start_session(&self, session: &Arc<Session>, logic: Box<dyn SessionLogic>) {
        self.prestart.lock().unwrap().insert(session.id(), logic);
        let sref = SessionRef::new(session, EngineId::Imap, RefReason::StartEvent);
        self.sender.pass_event(Event::session_start(sref));
    }

    /// Wait for the worker thread after a quit has drained.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct Worker {
    queue_rx: flume::Receiver<Event>,
    write_pool: Pool,
    upstream: EngineSender,
    prestart: Arc<Mutex<HashMap<u64, Box<dyn SessionLogic>>>>,
    sessions: HashMap<u64, ImapData>,
    outbox: VecDeque<OutItem>,
    quitting: bool,
    quit_pending: bool,
}

impl Worker {
    fn run(mut self) {
        while let Ok(ev) = self.queue_rx.recv() {
            match ev.kind {
                EventKind::SessionStart => self.on_session_start(ev),
                EventKind::Read => self.on_read(ev),
                EventKind::WriteDone => {
                    self.write_pool.release(ev);
                    self.drain_outbox();
                    if self.quit_pending && self.write_pool.is_full() {
                        // all of our write buffers are home; shutdown may
                        // proceed above us
                        self.upstream.pass_event(Event::quit_up());
                        return;
                    }
                }
                EventKind::SessionClose => {
                    if let Some(sref) = &ev.session {
                        self.sessions.remove(&sref.id());
                        self.prestart.lock().unwrap().remove(&sref.id());
                    }
                }
                EventKind::QuitDown => {
                    self.quitting = true;
                    // most-downstream engine: the quit bounces back up once
                    // our write events are all returned
                    if self.write_pool.is_full() {
                        self.upstream.pass_event(Event::quit_up());
                        return;
                    }
                    self.quit_pending = true;
                }
                other => {
                    warn!("unexpected event in imap engine: {other:?}");
                    ev.give_back();
                }
            }
        }
    }

    fn on_session_start(&mut self, ev: Event) {
        let Some(sref) = &ev.session else { return };
        if self.quitting {
            return;
        }
        let Some(logic) = self.prestart.lock().unwrap().remove(&sref.id()) else {
            warn!("session {} started without logic", sref.id());
            return;
        };
        let session = sref.session().clone();
        let mut data = ImapData { session, logic };

        let mut out = LogicOut::default();
        data.logic.on_start(&mut out);
        self.sessions.insert(data.session.id(), data);
        self.apply(out);
    }

    fn on_read(&mut self, ev: Event) {
        let Some(sref) = &ev.session else {
            ev.give_back();
            return;
        };
        let id = sref.id();
        if self.quitting || !self.sessions.contains_key(&id) {
            ev.give_back();
            return;
        }
        if sref.session().is_closed() {
            ev.give_back();
            return;
        }

        let mut out = LogicOut::default();
        let result = {
            let data = self.sessions.get_mut(&id).unwrap();
            if ev.buf.is_empty() {
                data.logic.on_eof(&mut out);
                Ok(())
            } else {
                data.logic.on_read(ev.buf.as_slice(), &mut out)
            }
        };
        if let Err(e) = result {
            let data = &self.sessions[&id];
            data.session.close(Some(e));
        }
        ev.give_back();
        self.apply(out);
    }

    fn apply(&mut self, out: LogicOut) {
        for item in out.items {
            if let OutItem::Data(session, data) = &item {
                debug!("session {}: queueing {} bytes", session.id(), data.len());
            }
            self.outbox.push_back(item);
        }
        self.drain_outbox();
        for (session, err) in out.closes {
            session.close(err);
        }
    }

    /// Move queued logic output into write events, in strict FIFO order, as
    /// long as the pool can supply buffers. Deferred actions run once
    /// everything ahead of them is on its way upstream.
    fn drain_outbox(&mut self) {
        loop {
            let Some(item) = self.outbox.pop_front() else {
                return;
            };
            let (session, data) = match item {
                OutItem::Action(f) => {
                    f();
                    continue;
                }
                OutItem::Data(session, data) => (session, data),
            };
            if session.is_closed() {
                continue;
            }
            let Some(mut ev) = self.write_pool.try_acquire() else {
                self.outbox.push_front(OutItem::Data(session, data));
                return;
            };
            let take = data.len().min(ev.buf.capacity());
            ev.buf.put(&data[..take]).expect("chunk fits event buffer");
            ev.kind = EventKind::Write;
            ev.session = Some(SessionRef::new(&session, EngineId::Imap, RefReason::Write));
            self.upstream.pass_event(ev);

            if take < data.len() {
                self.outbox.push_front(OutItem::Data(session, data[take..].to_vec()));
            }
        }
    }
}
