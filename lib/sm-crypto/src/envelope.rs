/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The splintermail message envelope: a PEM-framed, base64-wrapped stream
//! carrying a multi-recipient key wrap and an AES-256-GCM payload.
//!
//! ```text
//! -----BEGIN SPLINTERMAIL MESSAGE-----
//! <base64 at 64 columns of:
//!   V:1\n
//!   R:<fprlen>:<fpr>:<eklen>:<ek>\n      (one per recipient)
//!   IV:<ivlen>:<iv>\n
//!   M:<ciphertext...>>
//! =<base64(GCM tag)>
//! -----END SPLINTERMAIL MESSAGE-----
//! ```

use constant_time_eq::constant_time_eq;
use openssl::symm::{Cipher, Crypter, Mode};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use sm_types::{Error, ErrorKind, Result};

use crate::key::{Keypair, FINGERPRINT_LEN};
use crate::rand::random_bytes;

/// Server-enforced device cap; more recipients than this is a bad response.
pub const MAX_RECIPIENTS: usize = 32;

const FORMAT_VERSION: u32 = 1;
const B64_WIDTH: usize = 64;
const B64_CHUNK: usize = (B64_WIDTH / 4) * 3;
const GCM_TAG_LEN: usize = 16;
const MAX_LINE: usize = 256;

const PEM_HEADER: &[u8] = b"-----BEGIN SPLINTERMAIL MESSAGE-----";
const PEM_FOOTER: &[u8] = b"-----END SPLINTERMAIL MESSAGE-----";

fn cipher() -> Cipher {
    Cipher::aes_256_gcm()
}

/// Flush complete 48-byte chunks of `pre` into `out` as 64-column base64
/// lines; with `force`, flush the remainder as a final short line.
fn b64_stream(pre: &mut Vec<u8>, out: &mut Vec<u8>, force: bool) {
    let mut off = 0;
    while pre.len() - off >= B64_CHUNK {
        out.extend_from_slice(B64.encode(&pre[off..off + B64_CHUNK]).as_bytes());
        out.push(b'\n');
        off += B64_CHUNK;
    }
    pre.drain(..off);
    if force && !pre.is_empty() {
        out.extend_from_slice(B64.encode(&pre[..]).as_bytes());
        out.push(b'\n');
        pre.clear();
    }
}

/// Streaming encrypter: seals one symmetric key to every recipient, then
/// streams plaintext through AES-256-GCM into the base64 stager.
pub struct Encrypter {
    crypter: Option<Crypter>,
    pre64: Vec<u8>,
}

impl Encrypter {
    pub fn new() -> Self {
        Encrypter {
            crypter: None,
            pre64: Vec::with_capacity(B64_CHUNK * 2),
        }
    }

    /// Begin a message to `keys`, emitting the header and all metadata lines.
    pub fn start(&mut self, keys: &[Keypair], out: &mut Vec<u8>) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::param("no recipients to encrypt to"));
        }
        if keys.len() > MAX_RECIPIENTS {
            return Err(Error::new(
                ErrorKind::FixedSize,
                "too many pubkeys to encrypt to",
            ));
        }

        let cipher = cipher();
        let mut key = vec![0u8; cipher.key_len()];
        random_bytes(&mut key)?;
        let iv_len = cipher.iv_len().unwrap_or(12);
        let mut iv = vec![0u8; iv_len];
        random_bytes(&mut iv)?;

        // seal the symmetric key to every recipient before any output
        let mut wrapped = Vec::with_capacity(keys.len());
        for kp in keys {
            wrapped.push(kp.wrap_key(&key)?);
        }

        self.crypter = Some(Crypter::new(cipher, Mode::Encrypt, &key, Some(&iv))?);

        out.extend_from_slice(PEM_HEADER);
        out.push(b'\n');

        self.pre64.clear();
        self.pre64
            .extend_from_slice(format!("V:{FORMAT_VERSION}\n").as_bytes());
        b64_stream(&mut self.pre64, out, false);

        for (kp, ek) in keys.iter().zip(&wrapped) {
            let fpr = kp.fingerprint();
            self.pre64
                .extend_from_slice(format!("R:{}:", fpr.len()).as_bytes());
            self.pre64.extend_from_slice(fpr);
            self.pre64
                .extend_from_slice(format!(":{}:", ek.len()).as_bytes());
            self.pre64.extend_from_slice(ek);
            self.pre64.push(b'\n');
            b64_stream(&mut self.pre64, out, false);
        }

        self.pre64
            .extend_from_slice(format!("IV:{}:", iv.len()).as_bytes());
        self.pre64.extend_from_slice(&iv);
        self.pre64.extend_from_slice(b"\nM:");
        b64_stream(&mut self.pre64, out, false);

        Ok(())
    }

    /// Stream plaintext through the cipher into `out`.
    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let crypter = self
            .crypter
            .as_mut()
            .ok_or_else(|| Error::param("encrypter not started"))?;

        let mut scratch = vec![0u8; data.len() + cipher().block_size()];
        let n = crypter.update(data, &mut scratch)?;
        self.pre64.extend_from_slice(&scratch[..n]);
        b64_stream(&mut self.pre64, out, false);
        Ok(())
    }

    /// Flush the cipher, then emit the `=`-prefixed tag line and the footer.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut crypter = self
            .crypter
            .take()
            .ok_or_else(|| Error::param("encrypter not started"))?;

        let mut scratch = vec![0u8; cipher().block_size()];
        let n = crypter.finalize(&mut scratch)?;
        self.pre64.extend_from_slice(&scratch[..n]);
        b64_stream(&mut self.pre64, out, true);

        let mut tag = [0u8; GCM_TAG_LEN];
        crypter.get_tag(&mut tag)?;

        out.push(b'=');
        out.extend_from_slice(B64.encode(tag).as_bytes());
        out.push(b'\n');
        out.extend_from_slice(PEM_FOOTER);
        out.push(b'\n');
        Ok(())
    }
}

impl Default for Encrypter {
    fn default() -> Self {
        Encrypter::new()
    }
}

/// Streaming decrypter. Feed raw envelope bytes through `update`; plaintext
/// accumulates in the caller's output buffer; `finish` verifies the GCM tag.
pub struct Decrypter {
    kp: Option<Keypair>,
    crypter: Option<Crypter>,
    recipients: Vec<[u8; FINGERPRINT_LEN]>,
    enc_key: Vec<u8>,
    iv: Vec<u8>,
    pending: Vec<u8>,
    buffer: Vec<u8>,
    tag: Vec<u8>,
    header_found: bool,
    version_found: bool,
    key_found: bool,
    iv_found: bool,
    message_started: bool,
    tag_found: bool,
}

enum Parsed {
    NeedMore,
    Done(usize),
}

/// Parse a decimal length prefix terminated by `:`. The prefix is at most
/// four digits; anything longer is malformed.
fn parse_len_prefix(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    match buf.iter().position(|&b| b == b':') {
        Some(pos) if pos > 0 && pos <= 4 => {
            let s = std::str::from_utf8(&buf[..pos])
                .map_err(|_| Error::param("failed to parse length prefix"))?;
            let len: usize = s
                .parse()
                .map_err(|_| Error::param("failed to parse length prefix"))?;
            Ok(Some((pos + 1, len)))
        }
        Some(_) => Err(Error::param("failed to parse length prefix")),
        None if buf.len() > 5 => Err(Error::param("failed to parse length prefix")),
        None => Ok(None),
    }
}

impl Decrypter {
    pub fn new() -> Self {
        Decrypter {
            kp: None,
            crypter: None,
            recipients: Vec::new(),
            enc_key: Vec::new(),
            iv: Vec::new(),
            pending: Vec::new(),
            buffer: Vec::new(),
            tag: Vec::new(),
            header_found: false,
            version_found: false,
            key_found: false,
            iv_found: false,
            message_started: false,
            tag_found: false,
        }
    }

    /// Begin decrypting a message addressed (hopefully) to `kp`.
    pub fn start(&mut self, kp: &Keypair) {
        self.kp = Some(kp.clone());
        self.crypter = None;
        self.recipients.clear();
        self.enc_key.clear();
        self.iv.clear();
        self.pending.clear();
        self.buffer.clear();
        self.tag.clear();
        self.header_found = false;
        self.version_found = false;
        self.key_found = false;
        self.iv_found = false;
        self.message_started = false;
        self.tag_found = false;
    }

    /// Every `R:` fingerprint seen so far, in message order.
    pub fn recipients(&self) -> &[[u8; FINGERPRINT_LEN]] {
        &self.recipients
    }

    /// Consume envelope bytes from `input` (leaving any unconsumable
    /// partial-line tail), appending plaintext to `out`.
    pub fn update(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        let mut read = 0;

        if !self.header_found {
            if input.len() < PEM_HEADER.len() {
                return Ok(());
            }
            if &input[..PEM_HEADER.len()] != PEM_HEADER {
                return Err(Error::param("PEM header not found"));
            }
            self.header_found = true;
            read += PEM_HEADER.len();
        }

        while read < input.len() {
            if self.tag_found {
                // everything after the tag line is ignored (footer included)
                read = input.len();
                break;
            }

            let rest = &input[read..];
            let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
                if rest.len() > MAX_LINE {
                    return Err(self.fail(Error::param("bad decryption, line too long")));
                }
                break;
            };
            // mail transports deliver CRLF line endings
            let line = match rest[..nl].split_last() {
                Some((&b'\r', head)) => head,
                _ => &rest[..nl],
            };
            read += nl + 1;

            if line.is_empty() {
                continue;
            }

            if line[0] == b'=' {
                self.tag = B64
                    .decode(&line[1..])
                    .map_err(|_| Error::param("failed to parse tag line"))?;
                self.tag_found = true;
                read = input.len();
                break;
            }

            if line == PEM_FOOTER {
                continue;
            }

            let decoded = B64
                .decode(line)
                .map_err(|_| self.fail(Error::param("bad base64 in message")))?;
            self.buffer.extend_from_slice(&decoded);

            if !self.message_started {
                if let Err(e) = self.parse_metadata() {
                    return Err(self.fail(e));
                }
            }

            if self.message_started && !self.buffer.is_empty() {
                let crypter = self.crypter.as_mut().unwrap();
                let mut scratch = vec![0u8; self.buffer.len() + cipher().block_size()];
                let n = crypter
                    .update(&self.buffer, &mut scratch)
                    .map_err(|e| Error::ssl(format!("decrypt update failed: {e}")))?;
                out.extend_from_slice(&scratch[..n]);
                self.buffer.clear();
            }
        }

        input.drain(..read);
        Ok(())
    }

    /// Verify the GCM tag and flush any final plaintext.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.message_started {
            return Err(Error::param(
                "tried to finish decryption before the message began",
            ));
        }
        let mut crypter = self.crypter.take().unwrap();
        self.message_started = false;

        crypter
            .set_tag(&self.tag)
            .map_err(|e| Error::ssl(format!("failed to set GCM tag: {e}")))?;

        let mut scratch = vec![0u8; cipher().block_size()];
        let n = crypter
            .finalize(&mut scratch)
            .map_err(|e| Error::ssl(format!("message verification failed: {e}")))?;
        out.extend_from_slice(&scratch[..n]);
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Error {
        self.crypter = None;
        self.message_started = false;
        e
    }

    /// Parse complete metadata lines out of the decoded buffer, stopping at
    /// `M:` or when more data is needed.
    fn parse_metadata(&mut self) -> Result<()> {
        loop {
            if self.buffer.len() < 2 {
                return Ok(());
            }

            if self.buffer.starts_with(b"V:") {
                match self.parse_version()? {
                    Parsed::NeedMore => return Ok(()),
                    Parsed::Done(n) => {
                        self.buffer.drain(..n);
                        continue;
                    }
                }
            }

            if !self.version_found {
                return Err(Error::param("failed to parse message"));
            }

            if self.buffer.starts_with(b"R:") {
                match self.parse_recipient()? {
                    Parsed::NeedMore => return Ok(()),
                    Parsed::Done(n) => {
                        self.buffer.drain(..n);
                        continue;
                    }
                }
            }

            if self.buffer.starts_with(b"IV:") {
                match self.parse_iv()? {
                    Parsed::NeedMore => return Ok(()),
                    Parsed::Done(n) => {
                        self.buffer.drain(..n);
                        continue;
                    }
                }
            }

            if self.buffer.starts_with(b"M:") {
                if !self.key_found {
                    // citm catches this kind to skip messages meant for
                    // another device
                    return Err(Error::new(ErrorKind::Not4Me, "our key not found"));
                }
                if !self.iv_found {
                    return Err(Error::param("no IV found"));
                }
                self.start_cipher()?;
                self.buffer.drain(..2);
                return Ok(());
            }

            // an IV: line could be split after its first byte
            if self.buffer.len() < 3 && (self.buffer.starts_with(b"I") || self.buffer == [b'I']) {
                return Ok(());
            }

            return Err(Error::param("failed to parse message"));
        }
    }

    fn parse_version(&mut self) -> Result<Parsed> {
        let rest = &self.buffer[2..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            if rest.len() > 4 {
                return Err(Error::param("failed to parse version"));
            }
            return Ok(Parsed::NeedMore);
        };
        let s = std::str::from_utf8(&rest[..nl]).map_err(|_| Error::param("bad version"))?;
        let version: u32 = s.parse().map_err(|_| Error::param("bad version"))?;
        if version != FORMAT_VERSION {
            return Err(Error::param("unsupported message version"));
        }
        self.version_found = true;
        Ok(Parsed::Done(2 + nl + 1))
    }

    fn parse_recipient(&mut self) -> Result<Parsed> {
        let mut pos = 2;

        let Some((n, fpr_len)) = parse_len_prefix(&self.buffer[pos..])? else {
            return Ok(Parsed::NeedMore);
        };
        pos += n;
        if self.buffer.len() < pos + fpr_len + 1 {
            return Ok(Parsed::NeedMore);
        }
        let fpr = self.buffer[pos..pos + fpr_len].to_vec();
        pos += fpr_len;
        if self.buffer[pos] != b':' {
            return Err(Error::param("failed to parse R line"));
        }
        pos += 1;

        let Some((n, key_len)) = parse_len_prefix(&self.buffer[pos..])? else {
            return Ok(Parsed::NeedMore);
        };
        pos += n;
        if self.buffer.len() < pos + key_len + 1 {
            return Ok(Parsed::NeedMore);
        }
        let key = self.buffer[pos..pos + key_len].to_vec();
        pos += key_len;
        if self.buffer[pos] != b'\n' {
            return Err(Error::param("failed to parse R line"));
        }
        pos += 1;

        let our_fpr = self.kp.as_ref().unwrap().fingerprint();
        if fpr.len() == FINGERPRINT_LEN && constant_time_eq(&fpr, our_fpr) {
            self.key_found = true;
            self.enc_key = key;
        }
        if fpr.len() == FINGERPRINT_LEN {
            let mut arr = [0u8; FINGERPRINT_LEN];
            arr.copy_from_slice(&fpr);
            self.recipients.push(arr);
        }

        Ok(Parsed::Done(pos))
    }

    fn parse_iv(&mut self) -> Result<Parsed> {
        let mut pos = 3;

        let Some((n, iv_len)) = parse_len_prefix(&self.buffer[pos..])? else {
            return Ok(Parsed::NeedMore);
        };
        pos += n;
        if self.buffer.len() < pos + iv_len + 1 {
            return Ok(Parsed::NeedMore);
        }
        let iv = self.buffer[pos..pos + iv_len].to_vec();
        pos += iv_len;
        if self.buffer[pos] != b'\n' {
            return Err(Error::param("failed to parse IV line"));
        }
        pos += 1;

        if iv_len != cipher().iv_len().unwrap_or(12) {
            return Err(Error::param("found invalid IV"));
        }
        self.iv = iv;
        self.iv_found = true;
        Ok(Parsed::Done(pos))
    }

    fn start_cipher(&mut self) -> Result<()> {
        let kp = self.kp.as_ref().unwrap();
        let key = kp.unwrap_key(&self.enc_key)?;
        let cipher = cipher();
        if key.len() != cipher.key_len() {
            return Err(Error::ssl("unwrapped key has wrong length"));
        }
        self.crypter = Some(Crypter::new(cipher, Mode::Decrypt, &key, Some(&self.iv))?);
        self.message_started = true;
        Ok(())
    }
}

impl Default for Decrypter {
    fn default() -> Self {
        Decrypter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_to(keys: &[Keypair], plaintext: &[u8]) -> Vec<u8> {
        let mut ec = Encrypter::new();
        let mut out = Vec::new();
        ec.start(keys, &mut out).unwrap();
        ec.update(plaintext, &mut out).unwrap();
        ec.finish(&mut out).unwrap();
        out
    }

    fn decrypt_with(kp: &Keypair, msg: &[u8]) -> Result<Vec<u8>> {
        let mut dc = Decrypter::new();
        dc.start(kp);
        let mut input = msg.to_vec();
        let mut out = Vec::new();
        dc.update(&mut input, &mut out)?;
        dc.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn envelope_shape() {
        let kp = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(std::slice::from_ref(&kp), b"hello");
        let text = String::from_utf8(msg).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "-----BEGIN SPLINTERMAIL MESSAGE-----");
        assert_eq!(text.lines().last().unwrap(), "-----END SPLINTERMAIL MESSAGE-----");
        // body lines wrap at 64 columns, tag line starts with '='
        for line in lines {
            if line.starts_with('=') || line.starts_with("-----END") {
                break;
            }
            assert!(line.len() <= 64, "line too long: {line}");
        }
        assert!(text.contains("\n="));
    }

    #[test]
    fn round_trip_either_recipient() {
        let k1 = Keypair::generate(2048).unwrap();
        let k2 = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(&[k1.clone(), k2.clone()], b"hello");

        assert_eq!(decrypt_with(&k1, &msg).unwrap(), b"hello");
        assert_eq!(decrypt_with(&k2, &msg).unwrap(), b"hello");
    }

    #[test]
    fn not4me_for_unlisted_key() {
        let k1 = Keypair::generate(2048).unwrap();
        let k2 = Keypair::generate(2048).unwrap();
        let k3 = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(&[k1, k2], b"hello");

        let err = decrypt_with(&k3, &msg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Not4Me);
    }

    #[test]
    fn tampered_ciphertext_fails_verification() {
        let kp = Keypair::generate(2048).unwrap();
        let mut msg = encrypt_to(std::slice::from_ref(&kp), b"hello splintermail");

        // flip a bit inside the last base64 body line before the tag
        let tag_pos = msg.windows(2).rposition(|w| w == b"\n=").unwrap();
        let body_line_start = msg[..tag_pos].iter().rposition(|&b| b == b'\n').unwrap();
        // re-encode the damaged line so the base64 itself stays valid
        let line = msg[body_line_start + 1..tag_pos].to_vec();
        let mut decoded = B64.decode(&line).unwrap();
        *decoded.last_mut().unwrap() ^= 0x01;
        let reencoded = B64.encode(&decoded);
        msg.splice(body_line_start + 1..tag_pos, reencoded.into_bytes());

        let err = decrypt_with(&kp, &msg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ssl);
    }

    #[test]
    fn recipients_are_reported() {
        let k1 = Keypair::generate(2048).unwrap();
        let k2 = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(&[k1.clone(), k2.clone()], b"hi");

        let mut dc = Decrypter::new();
        dc.start(&k1);
        let mut input = msg;
        let mut out = Vec::new();
        dc.update(&mut input, &mut out).unwrap();
        dc.finish(&mut out).unwrap();
        assert_eq!(dc.recipients().len(), 2);
        assert_eq!(&dc.recipients()[0], k1.fingerprint());
        assert_eq!(&dc.recipients()[1], k2.fingerprint());
    }

    #[test]
    fn byte_at_a_time_feed() {
        let kp = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(std::slice::from_ref(&kp), b"drip-fed plaintext");

        let mut dc = Decrypter::new();
        dc.start(&kp);
        let mut held = Vec::new();
        let mut out = Vec::new();
        for &b in &msg {
            held.push(b);
            dc.update(&mut held, &mut out).unwrap();
        }
        dc.finish(&mut out).unwrap();
        assert_eq!(out, b"drip-fed plaintext");
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let kp = Keypair::generate(2048).unwrap();
        let msg = encrypt_to(std::slice::from_ref(&kp), b"dosified");
        let mut crlf = Vec::with_capacity(msg.len() * 2);
        for &b in &msg {
            if b == b'\n' {
                crlf.push(b'\r');
            }
            crlf.push(b);
        }
        assert_eq!(decrypt_with(&kp, &crlf).unwrap(), b"dosified");
    }

    #[test]
    fn garbage_is_rejected() {
        let kp = Keypair::generate(2048).unwrap();
        let mut dc = Decrypter::new();
        dc.start(&kp);
        let mut input = b"this is not an encrypted message at all....".to_vec();
        let mut out = Vec::new();
        let err = dc.update(&mut input, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Param);
    }

    #[test]
    fn too_many_recipients() {
        let kp = Keypair::generate(2048).unwrap();
        let keys = vec![kp; MAX_RECIPIENTS + 1];
        let mut ec = Encrypter::new();
        let mut out = Vec::new();
        let err = ec.start(&keys, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FixedSize);
    }
}
