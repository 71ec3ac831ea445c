/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use sm_types::Error;

use crate::engine::EngineSender;
use crate::event::{Event, EventKind};
use crate::pool::Pool;
use crate::session::{EngineId, RefReason, Session, SessionRef};
use crate::EVENT_BUF_SIZE;

enum Ctl {
    Register {
        id: u64,
        writer: OwnedWriteHalf,
        owner: SessionRef,
    },
}

/// The most-upstream engine: owns the TCP streams. A reader task per
/// session turns socket bytes into `Read` events (EOF is a zero-length
/// read), a writer task per session drains its `Write` events, and one
/// worker task routes events and registrations.
pub struct SocketEngine {
    sender: EngineSender,
    ctl_tx: flume::Sender<Ctl>,
    read_pool: Arc<Pool>,
    downstream: EngineSender,
    quit_rx: flume::Receiver<()>,
}

impl SocketEngine {
    /// Must be called inside a tokio runtime.
    pub fn new(
        queue: crate::engine::EngineQueue,
        downstream: EngineSender,
        nread_events: usize,
    ) -> SocketEngine {
        let (ctl_tx, ctl_rx) = flume::unbounded();
        let (quit_tx, quit_rx) = flume::bounded(1);
        let sender = queue.sender();
        let read_pool = Arc::new(Pool::new(
            nread_events,
            EVENT_BUF_SIZE,
            sender.clone(),
            EventKind::ReadDone,
        ));

        tokio::spawn(worker(
            queue.into_receiver(),
            ctl_rx,
            read_pool.clone(),
            downstream.clone(),
            quit_tx,
        ));

        SocketEngine {
            sender,
            ctl_tx,
            read_pool,
            downstream,
            quit_rx,
        }
    }

    pub fn sender(&self) -> EngineSender {
        self.sender.clone()
    }

    /// Adopt a connected stream and the session's owner reference, and
    /// start moving bytes. Call this last when wiring a session, so the
    /// other engines see their start events before any data.
    pub fn start_session(&self, owner: SessionRef, stream: TcpStream) {
        let session = owner.session().clone();
        let (reader, writer) = stream.into_split();
        let _ = self.ctl_tx.send(Ctl::Register {
            id: session.id(),
            writer,
            owner,
        });
        tokio::spawn(read_loop(
            session,
            reader,
            self.read_pool.clone(),
            self.downstream.clone(),
        ));
    }

    /// Begin pipeline shutdown: the quit flows downstream and surfaces back
    /// here once every engine has quiesced.
    pub fn initiate_quit(&self) {
        self.downstream.pass_event(Event::quit_down());
    }

    pub async fn wait_quit(&self) {
        let _ = self.quit_rx.recv_async().await;
    }
}

struct WriterEntry {
    tx: flume::Sender<Event>,
    // holding this keeps the session alive until its close event arrives
    _owner: SessionRef,
}

async fn worker(
    queue_rx: flume::Receiver<Event>,
    ctl_rx: flume::Receiver<Ctl>,
    read_pool: Arc<Pool>,
    downstream: EngineSender,
    quit_tx: flume::Sender<()>,
) {
    let mut writers: HashMap<u64, WriterEntry> = HashMap::new();

    loop {
        // registrations must win races against writes for the same session
        tokio::select! {
            biased;
            r = ctl_rx.recv_async() => {
                match r {
                    Ok(Ctl::Register { id, writer, owner }) => {
                        let (tx, rx) = flume::unbounded();
                        tokio::spawn(write_loop(owner.session().clone(), writer, rx));
                        writers.insert(id, WriterEntry { tx, _owner: owner });
                    }
                    Err(_) => return,
                }
            }
            r = queue_rx.recv_async() => {
                let Ok(ev) = r else { return };
                match ev.kind {
                    EventKind::Write => {
                        let Some(sref) = &ev.session else {
                            ev.give_back();
                            continue;
                        };
                        match writers.get(&sref.id()) {
                            Some(entry) => {
                                // a full handoff; the writer task returns it
                                let _ = entry.tx.send(ev);
                            }
                            None => {
                                error!(
                                    "write event for unregistered session {}",
                                    sref.id()
                                );
                                ev.give_back();
                            }
                        }
                    }
                    EventKind::ReadDone => {
                        read_pool.release(ev);
                    }
                    EventKind::SessionClose => {
                        if let Some(sref) = &ev.session {
                            /* dropping the entry hangs up the writer task
                               and releases the owner reference, letting the
                               session die once in-flight events drain */
                            writers.remove(&sref.id());
                        }
                    }
                    EventKind::QuitUp => {
                        // every downstream engine has quiesced
                        let _ = quit_tx.send(());
                        return;
                    }
                    EventKind::QuitDown => {
                        // we are the top of the pipeline; nothing above us
                        downstream.pass_event(Event::quit_down());
                    }
                    other => {
                        warn!("unexpected event in socket engine: {other:?}");
                        ev.give_back();
                    }
                }
            }
        }
    }
}

async fn write_loop(
    session: Arc<Session>,
    mut writer: OwnedWriteHalf,
    rx: flume::Receiver<Event>,
) {
    while let Ok(ev) = rx.recv_async().await {
        if session.is_closed() {
            ev.give_back();
            continue;
        }
        if let Err(e) = writer.write_all(ev.buf.as_slice()).await {
            debug!("session {}: socket write failed: {e}", session.id());
            session.close(Some(Error::from(e).ctx("socket write failed")));
        }
        ev.give_back();
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    session: Arc<Session>,
    reader: OwnedReadHalf,
    pool: Arc<Pool>,
    downstream: EngineSender,
) {
    loop {
        let mut ev = tokio::select! {
            _ = session.closed() => return,
            ev = pool.acquire() => match ev {
                Some(ev) => ev,
                None => return,
            },
        };

        let n = loop {
            tokio::select! {
                biased;
                _ = session.closed() => {
                    ev.give_back();
                    return;
                }
                r = reader.readable() => {
                    if let Err(e) = r {
                        ev.give_back();
                        session.close(Some(Error::from(e).ctx("socket poll failed")));
                        return;
                    }
                    match reader.try_read(ev.buf.spare_mut()) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => {
                            ev.give_back();
                            session.close(Some(Error::from(e).ctx("socket read failed")));
                            return;
                        }
                    }
                }
            }
        };

        ev.buf.set_len(n);
        ev.kind = EventKind::Read;
        ev.session = Some(SessionRef::new(&session, EngineId::Sock, RefReason::Read));
        downstream.pass_event(ev);

        if n == 0 {
            // EOF flows through the pipeline as a zero-length read
            return;
        }
    }
}
