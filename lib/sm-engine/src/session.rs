/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::error;
use tokio::sync::Notify;

use sm_types::Error;

use crate::engine::EngineSender;
use crate::event::Event;

/// The engines a session passes through, in downstream order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineId {
    Sock = 0,
    Tls = 1,
    Imap = 2,
}

pub(crate) const NENGINES: usize = 3;

/// Why a reference is held. The per-reason counters exist purely for leak
/// diagnosis; correctness rests on the total alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefReason {
    Read = 0,
    Write = 1,
    StartEvent = 2,
    CloseEvent = 3,
    Lifetime = 4,
}

const NREASONS: usize = 5;

const REASON_NAMES: [&str; NREASONS] = ["read", "write", "start_event", "close_event", "lifetime"];

type DestroyCb = Box<dyn FnOnce(Option<Error>) + Send>;

struct State {
    closed: bool,
    total: i64,
    guard: i64,
    counts: [[i64; NREASONS]; NENGINES],
    error: Option<Error>,
    on_destroyed: Option<DestroyCb>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The shared per-connection object. Engines never own a `Session`
/// directly; they hold reason-tagged [`SessionRef`]s, and the owner's
/// destroy callback fires exactly once, after the last reference drops.
pub struct Session {
    id: u64,
    upwards: bool,
    engines: [EngineSender; NENGINES],
    /// signalled once when the session closes, for async tasks that block on
    /// socket I/O rather than the event queues
    closed_notify: Notify,
    mu: Mutex<State>,
}

impl Session {
    /// Create a session. `upwards` sessions face the remote mail server (we
    /// are the TLS client); downwards sessions face the local mail client.
    ///
    /// The returned [`SessionRef`] is the owner reference that keeps the
    /// session alive while the engines are being wired up; hand it to the
    /// socket engine, which holds it until the session closes.
    pub fn new(
        upwards: bool,
        engines: [EngineSender; NENGINES],
        on_destroyed: impl FnOnce(Option<Error>) + Send + 'static,
    ) -> (Arc<Session>, SessionRef) {
        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            upwards,
            engines,
            closed_notify: Notify::new(),
            mu: Mutex::new(State {
                closed: false,
                total: 0,
                guard: 0,
                counts: [[0; NREASONS]; NENGINES],
                error: None,
                on_destroyed: Some(Box::new(on_destroyed)),
            }),
        });
        let owner = SessionRef::new(&session, EngineId::Sock, RefReason::Lifetime);
        (session, owner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn upwards(&self) -> bool {
        self.upwards
    }

    pub fn is_closed(&self) -> bool {
        self.mu.lock().unwrap().closed
    }

    /// Wait until `close` has been called; usable from any async task.
    pub async fn closed(&self) {
        let notified = self.closed_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub(crate) fn ref_up(&self, engine: EngineId, reason: RefReason) {
        let mut state = self.mu.lock().unwrap();
        state.total += 1;
        state.counts[engine as usize][reason as usize] += 1;
    }

    pub(crate) fn ref_down(self: &Arc<Self>, engine: EngineId, reason: RefReason) {
        let (cb, err) = {
            let mut state = self.mu.lock().unwrap();
            state.total -= 1;
            state.counts[engine as usize][reason as usize] -= 1;
            if state.counts[engine as usize][reason as usize] < 0 {
                error!(
                    "session {}: negative refcount for {:?}/{}",
                    self.id, engine, REASON_NAMES[reason as usize]
                );
            }
            if state.total > 0 || state.guard > 0 {
                return;
            }
            if state.total < 0 {
                error!("session {}: total refcount underflow", self.id);
            }
            (state.on_destroyed.take(), state.error.take())
        };
        // last reference: report the accumulated error exactly once
        if let Some(cb) = cb {
            cb(err);
        }
    }

    /// Close the session. Idempotent and callable from any thread: the first
    /// call delivers exactly one close event to every engine; later calls
    /// only merge their error into the one reported at destruction.
    pub fn close(self: &Arc<Self>, err: Option<Error>) {
        let deliver = {
            let mut state = self.mu.lock().unwrap();
            if let Some(err) = err {
                Error::merge(&mut state.error, err);
            }
            if state.closed {
                false
            } else {
                state.closed = true;
                // hold the session across the close-event fan-out
                state.guard += 1;
                true
            }
        };
        if !deliver {
            return;
        }

        self.closed_notify.notify_waiters();

        for (i, engine) in self.engines.iter().enumerate() {
            let id = match i {
                0 => EngineId::Sock,
                1 => EngineId::Tls,
                _ => EngineId::Imap,
            };
            let ev = Event::session_close(SessionRef::new(self, id, RefReason::CloseEvent));
            engine.pass_event(ev);
        }

        self.drop_guard();
    }

    fn drop_guard(self: &Arc<Self>) {
        let (cb, err) = {
            let mut state = self.mu.lock().unwrap();
            state.guard -= 1;
            if state.total > 0 || state.guard > 0 {
                return;
            }
            (state.on_destroyed.take(), state.error.take())
        };
        if let Some(cb) = cb {
            cb(err);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.mu.lock().unwrap();
        write!(
            f,
            "Session(id={}, {}, closed={}, refs={})",
            self.id,
            if self.upwards { "up" } else { "down" },
            state.closed,
            state.total,
        )
    }
}

/// An owned, reason-tagged reference to a session. Cloning refs up,
/// dropping refs down; the last drop triggers destruction.
pub struct SessionRef {
    session: Arc<Session>,
    engine: EngineId,
    reason: RefReason,
}

impl SessionRef {
    pub fn new(session: &Arc<Session>, engine: EngineId, reason: RefReason) -> SessionRef {
        session.ref_up(engine, reason);
        SessionRef {
            session: session.clone(),
            engine,
            reason,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn id(&self) -> u64 {
        self.session.id()
    }
}

impl Clone for SessionRef {
    fn clone(&self) -> Self {
        SessionRef::new(&self.session, self.engine, self.reason)
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.session.ref_down(self.engine, self.reason);
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionRef({}, {:?}/{:?})",
            self.session.id(),
            self.engine,
            self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn null_engines() -> [EngineSender; NENGINES] {
        [
            EngineSender::null("sock"),
            EngineSender::null("tls"),
            EngineSender::null("imap"),
        ]
    }

    #[test]
    fn destroy_fires_once_after_last_ref() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = destroyed.clone();
        let (session, owner) = Session::new(false, null_engines(), move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let r1 = owner;
        let r2 = r1.clone();
        let r3 = SessionRef::new(&session, EngineId::Tls, RefReason::Read);
        drop(r1);
        drop(r3);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(r2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_merges_errors() {
        let (err_tx, err_rx) = flume::unbounded();
        let (session, holder) = Session::new(false, null_engines(), move |err| {
            let _ = err_tx.send(err);
        });
        session.close(Some(Error::conn("peer reset")));
        session.close(Some(Error::ssl("late failure")));
        assert!(session.is_closed());
        drop(holder);

        let err = err_rx.try_recv().unwrap().unwrap();
        assert_eq!(err.kind(), sm_types::ErrorKind::Conn);
        assert!(err.trace().contains("late failure"));
    }

    #[test]
    fn concurrent_close_reports_one_primary() {
        for _ in 0..64 {
            let (err_tx, err_rx) = flume::unbounded();
            let (session, holder) = Session::new(false, null_engines(), move |err| {
                let _ = err_tx.send(err);
            });

            let mut joins = Vec::new();
            for i in 0..4 {
                let session = session.clone();
                joins.push(std::thread::spawn(move || {
                    session.close(Some(Error::conn(format!("closer {i}"))));
                }));
            }
            for join in joins {
                join.join().unwrap();
            }
            drop(holder);

            let err = err_rx.try_recv().unwrap().unwrap();
            assert_eq!(err.kind(), sm_types::ErrorKind::Conn);
            // all four traces were merged into the primary error
            for i in 0..4 {
                assert!(err.trace().contains(&format!("closer {i}")));
            }
        }
    }

    #[test]
    fn canceled_yields_to_specific_error() {
        let (err_tx, err_rx) = flume::unbounded();
        let (session, owner) = Session::new(true, null_engines(), move |err| {
            let _ = err_tx.send(err);
        });
        session.close(Some(Error::canceled()));
        session.close(Some(Error::ssl("real problem")));
        drop(owner);

        let err = err_rx.try_recv().unwrap().unwrap();
        assert_eq!(err.kind(), sm_types::ErrorKind::Ssl);
    }

    #[test]
    fn refs_during_close_delay_destruction() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = destroyed.clone();
        let (session, owner) = Session::new(false, null_engines(), move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let inflight = SessionRef::new(&session, EngineId::Tls, RefReason::Write);
        session.close(None);
        drop(owner);
        // the in-flight write still holds the session
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(inflight);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
