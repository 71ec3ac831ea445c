/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

mod key;
pub use key::{Keypair, FINGERPRINT_LEN};

mod keyshare;
pub use keyshare::{KeyEvent, Keyshare};

mod envelope;
pub use envelope::{Decrypter, Encrypter, MAX_RECIPIENTS};

mod rand;
pub use rand::{hmac_sha512, random_bytes, random_nonzero_u32, random_u32, random_u64};
