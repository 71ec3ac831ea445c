/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The TLS engine: a bidirectional TLS transform per session, driven as an
//! explicit state machine over in-memory BIOs. The engine never touches the
//! network; ciphertext moves through the event pipeline on both sides.

mod bio;

mod context;
pub use context::TlsContext;

mod driver;

mod engine;
pub use engine::{TlsEngine, TlsPrestart};
