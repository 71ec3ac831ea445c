/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

mod error;
pub use error::{Error, ErrorKind, Result, ResultExt};

mod buf;
pub use buf::FixedBuf;

mod status;
pub use status::{CitmStatus, StatusMaj, StatusMin, StatusUpdate, Tri};
