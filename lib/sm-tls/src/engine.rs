/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;

use log::warn;

use sm_engine::{
    EngineId, EngineSender, Event, EventKind, Pool, RefReason, Session, SessionRef,
    EVENT_BUF_SIZE,
};

use crate::context::TlsContext;
use crate::driver::{Shared, TlsData, TlsState};

/// Everything a session must declare before its start event: which context
/// to speak under (none for a plaintext passthrough session) and, for
/// upwards sessions, the name to verify.
pub struct TlsPrestart {
    pub ctx: Option<TlsContext>,
    pub verify_name: Option<String>,
}

enum SessState {
    /// No transform: events forward straight through, which is both the
    /// insecure-listener mode and the pre-upgrade phase of STARTTLS.
    Plain,
    Tls(TlsData),
}

/// The TLS engine: one worker thread transforming ciphertext (upstream,
/// socket side) to plaintext (downstream, IMAP side) and back for every
/// session.
pub struct TlsEngine {
    sender: EngineSender,
    prestart: Arc<Mutex<HashMap<u64, TlsPrestart>>>,
    join: Option<thread::JoinHandle<()>>,
}

impl TlsEngine {
    pub fn new(
        queue: sm_engine::EngineQueue,
        upstream: EngineSender,
        downstream: EngineSender,
        nread_events: usize,
        nwrite_events: usize,
    ) -> TlsEngine {
        let prestart: Arc<Mutex<HashMap<u64, TlsPrestart>>> = Arc::new(Mutex::new(HashMap::new()));

        let sender = queue.sender();
        let worker = Worker {
            queue_rx: queue.into_receiver(),
            sessions: HashMap::new(),
            prestart: prestart.clone(),
            sh: Shared {
                read_pool: Pool::new(
                    nread_events,
                    EVENT_BUF_SIZE,
                    sender.clone(),
                    EventKind::ReadDone,
                ),
                write_pool: Pool::new(
                    nwrite_events,
                    EVENT_BUF_SIZE,
                    sender.clone(),
                    EventKind::WriteDone,
                ),
                read_waiters: VecDeque::new(),
                write_waiters: VecDeque::new(),
                upstream,
                downstream,
            },
            quitting: false,
            quit_pending: false,
        };
        let join = thread::Builder::new()
            .name("tls-engine".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn tls engine thread");

        TlsEngine {
            sender,
            prestart,
            join: Some(join),
        }
    }

    pub fn sender(&self) -> EngineSender {
        self.sender.clone()
    }

    /// Declare the session's TLS configuration and deliver its start event.
    /// Must run before the socket engine starts reading for the session, so
    /// the start event stays first in line.
    pub fn start_session(&self, session: &Arc<Session>, prestart: TlsPrestart) {
        self.prestart.lock().unwrap().insert(session.id(), prestart);
        let sref = SessionRef::new(session, EngineId::Tls, RefReason::StartEvent);
        self.sender.pass_event(Event::session_start(sref));
    }

    /// Upgrade a passthrough session to TLS in place (the STARTTLS path).
    /// Any response promising the upgrade must already be queued so it goes
    /// out in plaintext.
    pub fn upgrade_session(&self, session: &Arc<Session>, ctx: TlsContext) {
        self.start_session(
            session,
            TlsPrestart {
                ctx: Some(ctx),
                verify_name: None,
            },
        );
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct Worker {
    queue_rx: flume::Receiver<Event>,
    sessions: HashMap<u64, SessState>,
    prestart: Arc<Mutex<HashMap<u64, TlsPrestart>>>,
    sh: Shared,
    quitting: bool,
    quit_pending: bool,
}

impl Worker {
    fn run(mut self) {
        while let Ok(ev) = self.queue_rx.recv() {
            match ev.kind {
                EventKind::SessionStart => self.on_session_start(ev),
                EventKind::Read => self.on_data(ev, /*read=*/ true),
                EventKind::Write => self.on_data(ev, /*read=*/ false),
                EventKind::ReadDone => {
                    self.sh.read_pool.release(ev);
                    self.serve_waiters(/*read=*/ true);
                }
                EventKind::WriteDone => {
                    self.sh.write_pool.release(ev);
                    self.serve_waiters(/*read=*/ false);
                    if self.quit_pending && self.sh.write_pool.is_full() {
                        self.sh.upstream.pass_event(Event::quit_up());
                        return;
                    }
                }
                EventKind::SessionClose => {
                    if let Some(sref) = &ev.session {
                        let id = sref.id();
                        self.prestart.lock().unwrap().remove(&id);
                        if let Some(SessState::Tls(mut td)) = self.sessions.remove(&id) {
                            td.on_close();
                        }
                    }
                }
                EventKind::QuitDown => {
                    self.quitting = true;
                    self.sh.downstream.pass_event(Event::quit_down());
                }
                EventKind::QuitUp => {
                    /* not done until every write buffer is home: a write
                       event still out could reference freed state */
                    if self.sh.write_pool.is_full() {
                        self.sh.upstream.pass_event(Event::quit_up());
                        return;
                    }
                    self.quit_pending = true;
                }
            }
        }
    }

    fn on_session_start(&mut self, ev: Event) {
        let Some(sref) = &ev.session else { return };
        if self.quitting {
            return;
        }
        let id = sref.id();
        let Some(prestart) = self.prestart.lock().unwrap().remove(&id) else {
            warn!("session {id} started without a TLS prestart");
            return;
        };
        let session = sref.session().clone();

        let Some(ctx) = prestart.ctx else {
            self.sessions.insert(id, SessState::Plain);
            return;
        };

        match TlsData::start(session.clone(), &ctx, prestart.verify_name.as_deref()) {
            Ok(td) => {
                // a second start for a live plain session is the STARTTLS
                // upgrade; a brand new session begins in TLS directly
                self.sessions.insert(id, SessState::Tls(td));
                let Some(SessState::Tls(td)) = self.sessions.get_mut(&id) else {
                    unreachable!();
                };
                td.advance(&mut self.sh, None, None);
            }
            Err(e) => session.close(Some(e.ctx("tls session setup failed"))),
        }
    }

    fn on_data(&mut self, ev: Event, read: bool) {
        let Some(sref) = &ev.session else {
            ev.give_back();
            return;
        };
        let id = sref.id();
        if self.quitting {
            ev.give_back();
            return;
        }
        let Some(state) = self.sessions.get_mut(&id) else {
            ev.give_back();
            return;
        };
        let td = match state {
            SessState::Plain => {
                /* passthrough: the event crosses this engine untouched, and
                   finds its way home through its own returner */
                if read {
                    self.sh.downstream.pass_event(ev);
                } else {
                    self.sh.upstream.pass_event(ev);
                }
                return;
            }
            SessState::Tls(td) => td,
        };
        if td.state == TlsState::Closed {
            ev.give_back();
            return;
        }

        if read {
            if td.wait_read_in && td.read_in.is_none() {
                td.wait_read_in = false;
                td.read_in = Some(ev);
                td.advance(&mut self.sh, None, None);
            } else {
                td.pending_reads.push_back(ev);
            }
        } else if td.wait_write_in && td.write_in.is_none() {
            td.wait_write_in = false;
            td.write_in = Some(ev);
            td.advance(&mut self.sh, None, None);
        } else {
            td.pending_writes.push_back(ev);
        }
    }

    /// A pool buffer came home; hand it to the first session still waiting
    /// for one.
    fn serve_waiters(&mut self, read: bool) {
        loop {
            let waiters = if read {
                &mut self.sh.read_waiters
            } else {
                &mut self.sh.write_waiters
            };
            let Some(&id) = waiters.front() else { return };

            let valid = match self.sessions.get(&id) {
                Some(SessState::Tls(td)) => {
                    if read {
                        td.wait_read_out
                    } else {
                        td.wait_write_out
                    }
                }
                _ => false,
            };
            if !valid {
                let waiters = if read {
                    &mut self.sh.read_waiters
                } else {
                    &mut self.sh.write_waiters
                };
                waiters.pop_front();
                continue;
            }

            let pool = if read {
                &self.sh.read_pool
            } else {
                &self.sh.write_pool
            };
            let Some(ev) = pool.try_acquire() else { return };

            if read {
                self.sh.read_waiters.pop_front();
            } else {
                self.sh.write_waiters.pop_front();
            }
            let Some(SessState::Tls(td)) = self.sessions.get_mut(&id) else {
                unreachable!();
            };
            if read {
                td.wait_read_out = false;
                td.advance(&mut self.sh, Some(ev), None);
            } else {
                td.wait_write_out = false;
                td.advance(&mut self.sh, None, Some(ev));
            }
        }
    }
}
