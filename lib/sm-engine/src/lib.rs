/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The citm session pipeline: a per-connection session object shared by
//! three cooperating engines (socket, TLS, IMAP), with reference-counted
//! teardown that is safe from any thread.
//!
//! Events flow downstream (socket → TLS → IMAP) as `Read`s and upstream as
//! `Write`s; each engine owns two fixed-size event pools whose exhaustion is
//! the pipeline's backpressure mechanism.

mod session;
pub use session::{EngineId, RefReason, Session, SessionRef};

mod event;
pub use event::{Event, EventKind, Returner};

mod pool;
pub use pool::Pool;

mod engine;
pub use engine::{EngineQueue, EngineSender};

mod sock;
pub use sock::SocketEngine;

mod imap;
pub use imap::{ImapEngine, LogicOut, SessionLogic};

/// Payload capacity of pipeline events.
pub const EVENT_BUF_SIZE: usize = 4096;
