/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! Per-user citm glue: the ignore list, the key directory, and the relay
//! logic that weaves the message codec into the IMAP byte stream.

mod ignore;
pub use ignore::{IgnoreList, SharedIgnoreList};

mod keydir;
pub use keydir::KeyDir;

mod relay;
pub use relay::{RelayDown, RelayShared, RelayUp, RELAY_GREETING};

mod gate;
pub use gate::StartTlsGate;

mod msg;
pub use msg::StreamDecrypter;
