/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;

use crate::{Error, ErrorKind, Result};

/// A fixed-capacity byte buffer. Appends beyond the capacity fail with
/// `FixedSize` instead of reallocating, so event payloads and codec staging
/// areas keep a bounded footprint on the hot path.
pub struct FixedBuf {
    data: Box<[u8]>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> Self {
        FixedBuf {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append bytes, failing with `FixedSize` if they do not fit.
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(Error::new(
                ErrorKind::FixedSize,
                format!(
                    "buffer overflow: {} bytes into {} free",
                    bytes.len(),
                    self.remaining()
                ),
            ));
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// The writable tail, for callers that fill the buffer directly (socket
    /// reads, cipher output). Pair with `set_len`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Set the filled length after a direct write into `spare_mut`.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    /// Discard the first `n` bytes, shifting the remainder to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl fmt::Debug for FixedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBuf[{}/{}]", self.len, self.data.len())
    }
}
