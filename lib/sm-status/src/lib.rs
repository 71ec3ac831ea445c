/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The citm status socket: newline-delimited JSON over a local stream
//! socket. The server pushes a full status object on connect and subset
//! updates afterwards; clients may ask the daemon to re-check its state.

mod line;

mod server;
pub use server::StatusServer;

mod client;
pub use client::StatusClient;

/// Longest accepted command line, terminator included.
pub const MAX_LINE: usize = 4096;
