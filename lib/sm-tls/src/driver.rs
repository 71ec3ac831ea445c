/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::VecDeque;
use std::sync::Arc;

use openssl::ssl::{ErrorCode, SslStream};

use sm_engine::{EngineId, EngineSender, Event, EventKind, Pool, RefReason, Session, SessionRef};
use sm_types::{Error, ErrorKind};

use crate::bio::MemBio;
use crate::context::{map_ssl_failure, TlsContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TlsState {
    Idle,
    WaitingForEmptyWriteBio,
    Closed,
}

/// Engine-level resources the per-session driver draws on: the two event
/// pools (with their waiter lists) and the neighbouring engines.
pub(crate) struct Shared {
    pub(crate) read_pool: Pool,
    pub(crate) write_pool: Pool,
    pub(crate) read_waiters: VecDeque<u64>,
    pub(crate) write_waiters: VecDeque<u64>,
    pub(crate) upstream: EngineSender,
    pub(crate) downstream: EngineSender,
}

/// Per-session TLS state: the SSL object over its memory BIOs, the pending
/// event queues, and the state machine driving them.
pub(crate) struct TlsData {
    session: Arc<Session>,
    ssl: SslStream<MemBio>,
    pub(crate) pending_reads: VecDeque<Event>,
    pub(crate) pending_writes: VecDeque<Event>,
    pub(crate) read_in: Option<Event>,
    pub(crate) write_in: Option<Event>,
    want_read: bool,
    eof_recvd: bool,
    eof_sent: bool,
    tls_eof_recvd: bool,
    pub(crate) state: TlsState,
    pub(crate) wait_read_in: bool,
    pub(crate) wait_write_in: bool,
    pub(crate) wait_read_out: bool,
    pub(crate) wait_write_out: bool,
}

impl TlsData {
    /// Build the per-session SSL machinery; upwards sessions fire the first
    /// handshake step so the ClientHello lands in the write BIO.
    pub(crate) fn start(
        session: Arc<Session>,
        ctx: &TlsContext,
        verify_name: Option<&str>,
    ) -> Result<TlsData, Error> {
        let upwards = session.upwards();
        let ssl = ctx.new_ssl(upwards, verify_name)?;
        let stream = SslStream::new(ssl, MemBio::new())
            .map_err(|e| Error::ssl(format!("unable to create SSL stream: {e}")))?;

        let mut td = TlsData {
            session,
            ssl: stream,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
            read_in: None,
            write_in: None,
            want_read: false,
            eof_recvd: false,
            eof_sent: false,
            tls_eof_recvd: false,
            state: TlsState::Idle,
            wait_read_in: false,
            wait_write_in: false,
            wait_read_out: false,
            wait_write_out: false,
        };

        if upwards {
            // the client opens the conversation
            match td.ssl.do_handshake() {
                Ok(()) => {}
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => td.want_read = true,
                    ErrorCode::WANT_WRITE => {
                        if td.ssl.get_ref().outgoing_is_empty() {
                            return Err(Error::new(
                                ErrorKind::NoMem,
                                "got WANT_WRITE with an empty write buffer",
                            ));
                        }
                    }
                    _ => {
                        return Err(map_ssl_failure(td.ssl.ssl(), "TLS handshake failed"));
                    }
                },
            }
        }

        Ok(td)
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Release everything the session holds; called exactly once when the
    /// close event reaches the engine thread.
    pub(crate) fn on_close(&mut self) {
        self.state = TlsState::Closed;
        self.wait_read_in = false;
        self.wait_write_in = false;
        self.wait_read_out = false;
        self.wait_write_out = false;
        if let Some(ev) = self.read_in.take() {
            ev.give_back();
        }
        if let Some(ev) = self.write_in.take() {
            ev.give_back();
        }
        while let Some(ev) = self.pending_reads.pop_front() {
            ev.give_back();
        }
        while let Some(ev) = self.pending_writes.pop_front() {
            ev.give_back();
        }
    }

    /// Run the state machine until no transition fires. Any buffer handed in
    /// (from a pool waiter callback) that goes unused is returned to its
    /// pool. After the loop the session is either waiting on at least one
    /// queue or closed; anything else is a hang and kills the session.
    pub(crate) fn advance(
        &mut self,
        sh: &mut Shared,
        mut read_out: Option<Event>,
        mut write_out: Option<Event>,
    ) {
        let mut should_continue = true;
        while should_continue {
            should_continue = match self.state {
                TlsState::Idle => self.enter_idle(sh, &mut read_out),
                TlsState::WaitingForEmptyWriteBio => self.enter_wfewb(sh, &mut write_out),
                TlsState::Closed => false,
            };
        }

        if let Some(ev) = read_out.take() {
            ev.give_back();
        }
        if let Some(ev) = write_out.take() {
            ev.give_back();
        }

        if self.state != TlsState::Closed
            && !self.wait_read_in
            && !self.wait_write_in
            && !self.wait_read_out
            && !self.wait_write_out
        {
            self.fail(Error::internal("tls session is hung; killing it"));
        }
    }

    fn fail(&mut self, e: Error) {
        self.session.close(Some(e));
        self.state = TlsState::Closed;
    }

    fn enter_idle(&mut self, sh: &mut Shared, read_out: &mut Option<Event>) -> bool {
        // ciphertext waiting in the write BIO takes priority over everything
        if !self.ssl.get_ref().outgoing_is_empty() {
            self.state = TlsState::WaitingForEmptyWriteBio;
            return true;
        }

        // already-processed bytes are readable without touching rawin
        let mut readable = self.ssl.ssl().pending() > 0;

        /* an unconsumed rawin is readable unless the last SSL_read told us
           WANT_READ and nothing new has arrived since */
        if !readable {
            readable = !self.want_read && !self.ssl.get_ref().incoming_is_empty();
        }

        // try to feed a pending socket read into the read BIO
        if !readable {
            if self.read_in.is_none() {
                match self.pending_reads.pop_front() {
                    Some(ev) => {
                        self.read_in = Some(ev);
                        self.wait_read_in = false;
                    }
                    None => self.wait_read_in = true,
                }
            }
            if let Some(ev) = self.read_in.take() {
                if self.eof_recvd {
                    ev.give_back();
                    self.fail(Error::internal("received data after EOF"));
                    return true;
                }
                if !ev.buf.is_empty() {
                    self.ssl.get_mut().push_incoming(ev.buf.as_slice());
                    readable = true;
                    self.want_read = false;
                } else if self.want_read {
                    // a write needed a packet but we got EOF instead
                    ev.give_back();
                    self.fail(Error::conn("unexpected EOF from socket"));
                    return true;
                } else {
                    // after this we expect no more reads or WANT_READs
                    self.eof_recvd = true;
                    self.eof_sent = false;
                }
                ev.give_back();
            }
        }

        let eof_unsent = self.eof_recvd && !self.eof_sent;

        // something to read, or an EOF to pass downstream?
        if readable || eof_unsent {
            if read_out.is_none() {
                match sh.read_pool.try_acquire() {
                    Some(ev) => {
                        *read_out = Some(ev);
                        self.wait_read_out = false;
                    }
                    None => {
                        if !self.wait_read_out {
                            self.wait_read_out = true;
                            sh.read_waiters.push_back(self.session.id());
                        }
                    }
                }
            }
            if read_out.is_some() {
                if eof_unsent {
                    let mut ev = read_out.take().unwrap();
                    ev.buf.clear();
                    ev.kind = EventKind::Read;
                    ev.session = Some(SessionRef::new(
                        &self.session,
                        EngineId::Tls,
                        RefReason::Read,
                    ));
                    sh.downstream.pass_event(ev);
                    self.eof_sent = true;
                } else {
                    self.do_ssl_read(sh, read_out);
                }
                // the top of Idle rechecks whether the write BIO needs
                // emptying
                return true;
            }
        }

        // a write after WANT_READ would just fail again
        if !self.want_read {
            if self.write_in.is_none() {
                match self.pending_writes.pop_front() {
                    Some(ev) => {
                        self.write_in = Some(ev);
                        self.wait_write_in = false;
                    }
                    None => self.wait_write_in = true,
                }
            }
            if self.write_in.is_some() {
                self.do_ssl_write();
                return true;
            }
        }

        false
    }

    fn do_ssl_read(&mut self, sh: &mut Shared, read_out: &mut Option<Event>) {
        if self.tls_eof_recvd {
            self.fail(Error::ssl("unable to read after the TLS close_notify alert"));
            return;
        }
        let ev = read_out.as_mut().unwrap();
        match self.ssl.ssl_read(ev.buf.spare_mut()) {
            Ok(n) => {
                let mut ev = read_out.take().unwrap();
                ev.buf.set_len(n);
                ev.kind = EventKind::Read;
                ev.session = Some(SessionRef::new(
                    &self.session,
                    EngineId::Tls,
                    RefReason::Read,
                ));
                sh.downstream.pass_event(ev);
            }
            Err(e) => match e.code() {
                ErrorCode::ZERO_RETURN => {
                    // a TLS-layer EOF
                    self.tls_eof_recvd = true;
                }
                ErrorCode::WANT_READ => {
                    if self.eof_recvd {
                        self.fail(Error::conn("unexpected EOF from socket"));
                    }
                    /* want_read is not set here: we may be unable to read
                       without more input while an SSL_write could still make
                       progress */
                }
                ErrorCode::WANT_WRITE => {
                    if self.ssl.get_ref().outgoing_is_empty() {
                        self.fail(Error::new(
                            ErrorKind::NoMem,
                            "got WANT_WRITE with an empty write buffer",
                        ));
                    }
                }
                _ => {
                    self.fail(map_ssl_failure(self.ssl.ssl(), "error in SSL_read"));
                }
            },
        }
    }

    fn do_ssl_write(&mut self) {
        let ev = self.write_in.as_ref().unwrap();
        match self.ssl.ssl_write(ev.buf.as_slice()) {
            Ok(_) => {
                // done with this buffer
                self.write_in.take().unwrap().give_back();
            }
            /* on a retryable failure write_in is left exactly as it is:
               SSL_write must be retried with identical arguments */
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => {
                    if self.eof_recvd {
                        self.fail(Error::conn("unexpected EOF from socket"));
                        return;
                    }
                    self.want_read = true;
                }
                ErrorCode::WANT_WRITE => {
                    if self.ssl.get_ref().outgoing_is_empty() {
                        self.fail(Error::new(
                            ErrorKind::NoMem,
                            "got WANT_WRITE with an empty write buffer",
                        ));
                    }
                }
                _ => {
                    self.fail(map_ssl_failure(self.ssl.ssl(), "error in SSL_write"));
                }
            },
        }
    }

    /// Drain the write BIO into a write event and pass it upstream.
    fn enter_wfewb(&mut self, sh: &mut Shared, write_out: &mut Option<Event>) -> bool {
        if write_out.is_none() {
            match sh.write_pool.try_acquire() {
                Some(ev) => {
                    *write_out = Some(ev);
                    self.wait_write_out = false;
                }
                None => {
                    if !self.wait_write_out {
                        self.wait_write_out = true;
                        sh.write_waiters.push_back(self.session.id());
                    }
                    return false;
                }
            }
        }

        let mut ev = write_out.take().unwrap();
        let n = self.ssl.get_mut().take_outgoing(ev.buf.spare_mut());
        if n == 0 {
            ev.give_back();
            self.fail(Error::ssl("reading from memory buffer failed"));
            return false;
        }
        ev.buf.set_len(n);
        ev.kind = EventKind::Write;
        ev.session = Some(SessionRef::new(
            &self.session,
            EngineId::Tls,
            RefReason::Write,
        ));
        sh.upstream.pass_event(ev);
        self.state = TlsState::Idle;
        true
    }
}
