/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! kvpsync replicates a small key-value table from one sender to many
//! receivers over unreliable datagrams, converging after either side
//! restarts and exposing a bounded freshness guarantee to readers.

mod pkts;
pub use pkts::{Ack, PktDecodeError, Update, UpdateBody, KVPSYNC_MAX_LEN};

mod recv;
pub use recv::{Lookup, Receiver};

mod send;
pub use send::Sender;

mod io;
pub use io::{now_ms, ReceiverIo, SenderIo};

/// Milliseconds; all kvpsync timestamps are caller-supplied `u64` ms.
pub const SECOND: u64 = 1000;

/// The freshness bound: a receiver is never promised OK further than this
/// past the oldest unacknowledged insert.
pub const MIN_RESPONSE: u64 = 15 * SECOND;

/// How long an annihilated insert/delete pair is remembered, so a late
/// duplicate cannot resurrect a deleted value. The IPv4 max TTL in seconds.
pub const GC_DELAY: u64 = 255 * SECOND;
