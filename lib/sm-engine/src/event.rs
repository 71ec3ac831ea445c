/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;

use sm_types::FixedBuf;

use crate::engine::EngineSender;
use crate::session::SessionRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Read,
    ReadDone,
    Write,
    WriteDone,
    SessionStart,
    SessionClose,
    QuitDown,
    QuitUp,
}

/// How an event finds its way home: the owning engine's queue plus the kind
/// that marks it as returned.
#[derive(Clone)]
pub struct Returner {
    pub(crate) owner: EngineSender,
    pub(crate) done_kind: EventKind,
}

/// The typed envelope that circulates through the pipeline. Pooled events
/// (reads and writes) carry a buffer and a returner; control events carry
/// neither.
pub struct Event {
    pub kind: EventKind,
    pub session: Option<SessionRef>,
    pub buf: FixedBuf,
    returner: Option<Returner>,
}

impl Event {
    /// A pooled event, born in the given engine's pool.
    pub fn pooled(capacity: usize, returner: Returner) -> Event {
        Event {
            kind: returner.done_kind,
            session: None,
            buf: FixedBuf::new(capacity),
            returner: Some(returner),
        }
    }

    pub fn session_start(session: SessionRef) -> Event {
        Event {
            kind: EventKind::SessionStart,
            session: Some(session),
            buf: FixedBuf::new(0),
            returner: None,
        }
    }

    pub fn session_close(session: SessionRef) -> Event {
        Event {
            kind: EventKind::SessionClose,
            session: Some(session),
            buf: FixedBuf::new(0),
            returner: None,
        }
    }

    pub fn quit_down() -> Event {
        Event {
            kind: EventKind::QuitDown,
            session: None,
            buf: FixedBuf::new(0),
            returner: None,
        }
    }

    pub fn quit_up() -> Event {
        Event {
            kind: EventKind::QuitUp,
            session: None,
            buf: FixedBuf::new(0),
            returner: None,
        }
    }

    /// Release the event back to its originating pool: the session
    /// reference drops and the kind flips to the matching `*Done`.
    pub fn give_back(mut self) {
        self.session = None;
        let Some(returner) = self.returner.clone() else {
            // control events simply expire
            return;
        };
        self.kind = returner.done_kind;
        self.buf.clear();
        // a disconnected owner means the pipeline is already torn down
        returner.owner.pass_event(self);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event({:?}, session={:?}, len={})",
            self.kind,
            self.session.as_ref().map(|s| s.id()),
            self.buf.len()
        )
    }
}
