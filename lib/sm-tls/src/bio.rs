/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::VecDeque;
use std::io;

/// The rawin/rawout pair under an `SslStream`: reads drain `incoming`
/// (ciphertext pushed in by the socket side) and writes fill `outgoing`
/// (ciphertext the socket side must drain). An empty `incoming` reads as
/// `WouldBlock`, which OpenSSL surfaces as `WANT_READ`.
pub(crate) struct MemBio {
    incoming: VecDeque<u8>,
    outgoing: VecDeque<u8>,
}

impl MemBio {
    pub(crate) fn new() -> MemBio {
        MemBio {
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub(crate) fn push_incoming(&mut self, data: &[u8]) {
        self.incoming.extend(data);
    }

    pub(crate) fn incoming_is_empty(&self) -> bool {
        self.incoming.is_empty()
    }

    pub(crate) fn outgoing_is_empty(&self) -> bool {
        self.outgoing.is_empty()
    }

    /// Move up to `buf.len()` outgoing ciphertext bytes out.
    pub(crate) fn take_outgoing(&mut self, buf: &mut [u8]) -> usize {
        let n = self.outgoing.len().min(buf.len());
        for (i, b) in self.outgoing.drain(..n).enumerate() {
            buf[i] = b;
        }
        n
    }
}

impl io::Read for MemBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = self.incoming.len().min(buf.len());
        for (i, b) in self.incoming.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }
}

impl io::Write for MemBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn empty_read_would_block() {
        let mut bio = MemBio::new();
        let mut buf = [0u8; 8];
        let err = bio.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn incoming_and_outgoing_are_independent() {
        let mut bio = MemBio::new();
        bio.push_incoming(b"ciphertext-in");
        bio.write_all(b"ciphertext-out").unwrap();

        let mut buf = [0u8; 64];
        let n = bio.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ciphertext-in");
        assert!(bio.incoming_is_empty());

        let n = bio.take_outgoing(&mut buf);
        assert_eq!(&buf[..n], b"ciphertext-out");
        assert!(bio.outgoing_is_empty());
    }

    #[test]
    fn take_outgoing_respects_buffer_size() {
        let mut bio = MemBio::new();
        bio.write_all(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(bio.take_outgoing(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(bio.take_outgoing(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
