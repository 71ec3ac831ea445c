/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::sync::Arc;

use log::{debug, warn};
use openssl::hash::{hash, MessageDigest};

use sm_crypto::{Decrypter, Keypair};
use sm_types::ErrorKind;

use crate::citm::SharedIgnoreList;

const ENV_HEADER: &[u8] = b"-----BEGIN SPLINTERMAIL MESSAGE-----";
const ENV_FOOTER: &[u8] = b"-----END SPLINTERMAIL MESSAGE-----";

enum Mode {
    Passthrough,
    InEnvelope { envelope: Vec<u8> },
}

/// Scans the server-to-client byte stream for splintermail envelopes and
/// replaces each with its decrypted plaintext. Messages addressed to a
/// different device pass through untouched and are remembered on the ignore
/// list; damaged messages pass through untouched with a warning.
pub struct StreamDecrypter {
    keypair: Keypair,
    ignore: Arc<SharedIgnoreList>,
    mode: Mode,
    partial: Vec<u8>,
}

impl StreamDecrypter {
    pub fn new(keypair: Keypair, ignore: Arc<SharedIgnoreList>) -> StreamDecrypter {
        StreamDecrypter {
            keypair,
            ignore,
            mode: Mode::Passthrough,
            partial: Vec::new(),
        }
    }

    /// Feed stream bytes; returns the bytes to forward to the client.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        self.partial.extend_from_slice(data);

        loop {
            let Some(nl) = self.partial.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.partial.drain(..=nl).collect();
            self.handle_line(&line, &mut out);
        }

        /* an incomplete tail is held back only while it could still become
           the envelope header (or while inside an envelope); everything
           else flows immediately */
        let hold = match self.mode {
            Mode::InEnvelope { .. } => true,
            Mode::Passthrough => {
                !self.partial.is_empty() && ENV_HEADER.starts_with(self.partial.as_slice())
            }
        };
        if !hold && !self.partial.is_empty() {
            out.extend_from_slice(&self.partial);
            self.partial.clear();
        }

        out
    }

    /// Flush any held bytes, e.g. at connection EOF.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        match std::mem::replace(&mut self.mode, Mode::Passthrough) {
            Mode::Passthrough => {}
            Mode::InEnvelope { envelope } => {
                // truncated envelope: give the client what we have
                out.extend_from_slice(&envelope);
            }
        }
        out.append(&mut self.partial);
        out
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let trimmed = strip_eol(line);
        match &mut self.mode {
            Mode::Passthrough => {
                if trimmed == ENV_HEADER {
                    self.mode = Mode::InEnvelope {
                        envelope: line.to_vec(),
                    };
                } else {
                    out.extend_from_slice(line);
                }
            }
            Mode::InEnvelope { envelope } => {
                envelope.extend_from_slice(line);
                if trimmed == ENV_FOOTER {
                    let envelope = std::mem::take(envelope);
                    self.mode = Mode::Passthrough;
                    self.process_envelope(&envelope, out);
                }
            }
        }
    }

    fn process_envelope(&mut self, envelope: &[u8], out: &mut Vec<u8>) {
        let uid = envelope_uid(envelope);

        if self.ignore.should_ignore(&uid) {
            debug!("passing through message {uid} on the ignore list");
            out.extend_from_slice(envelope);
            return;
        }

        let mut dc = Decrypter::new();
        dc.start(&self.keypair);
        let mut input = envelope.to_vec();
        let mut plain = Vec::new();
        let result = dc
            .update(&mut input, &mut plain)
            .and_then(|()| dc.finish(&mut plain));

        match result {
            Ok(()) => out.append(&mut plain),
            Err(e) if e.kind() == ErrorKind::Not4Me => {
                debug!("message {uid} is for another device");
                self.ignore.add(&uid);
                out.extend_from_slice(envelope);
            }
            Err(e) => {
                warn!("failed to decrypt message {uid}: {e}");
                out.extend_from_slice(envelope);
            }
        }
    }
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Message identifier for the ignore list. The protocol-level UID belongs
/// to the IMAP layer; the envelope digest identifies the same bytes on
/// every future download.
fn envelope_uid(envelope: &[u8]) -> String {
    match hash(MessageDigest::sha256(), envelope) {
        Ok(digest) => hex::encode(&digest[..16]),
        // digests only fail under allocation pressure; fall back to a weak
        // identifier rather than dropping the record
        Err(_) => format!("len-{}", envelope.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_crypto::Encrypter;
    use std::path::PathBuf;

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sm-msg-test-{:08x}", fastrand::u32(..)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn envelope_for(keys: &[Keypair], plaintext: &[u8]) -> Vec<u8> {
        let mut ec = Encrypter::new();
        let mut out = Vec::new();
        ec.start(keys, &mut out).unwrap();
        ec.update(plaintext, &mut out).unwrap();
        ec.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn envelopes_are_replaced_with_plaintext() {
        let dir = tempdir();
        let kp = Keypair::generate(2048).unwrap();
        let ignore = Arc::new(SharedIgnoreList::load(&dir));
        let mut sd = StreamDecrypter::new(kp.clone(), ignore);

        let envelope = envelope_for(std::slice::from_ref(&kp), b"Subject: hi\r\n\r\nhello\r\n");
        let mut stream = Vec::new();
        stream.extend_from_slice(b"* 1 FETCH (BODY[] {999}\r\n");
        stream.extend_from_slice(&envelope);
        stream.extend_from_slice(b")\r\n");

        let mut got = Vec::new();
        // drip-feed in odd chunks to exercise resumption
        for chunk in stream.chunks(7) {
            got.extend(sd.feed(chunk));
        }
        got.extend(sd.finish());

        let text = String::from_utf8_lossy(&got);
        assert!(text.contains("hello"), "plaintext missing: {text}");
        assert!(!text.contains("BEGIN SPLINTERMAIL"), "envelope leaked: {text}");
        assert!(text.starts_with("* 1 FETCH"));
        assert!(text.ends_with(")\r\n"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn not4me_passes_through_and_is_remembered() {
        let dir = tempdir();
        let ours = Keypair::generate(2048).unwrap();
        let theirs = Keypair::generate(2048).unwrap();
        let ignore = Arc::new(SharedIgnoreList::load(&dir));
        let mut sd = StreamDecrypter::new(ours, ignore.clone());

        let envelope = envelope_for(std::slice::from_ref(&theirs), b"not ours");
        let got = sd.feed(&envelope);
        assert_eq!(got, envelope);

        // the same message again is recognized without another decrypt
        let uid = envelope_uid(&envelope);
        assert!(ignore.should_ignore(&uid));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn plain_traffic_flows_untouched() {
        let dir = tempdir();
        let kp = Keypair::generate(2048).unwrap();
        let ignore = Arc::new(SharedIgnoreList::load(&dir));
        let mut sd = StreamDecrypter::new(kp, ignore);

        let mut got = sd.feed(b"* OK ready\r\na1 LOGIN user pass\r\n");
        got.extend(sd.feed(b"partial line without newline"));
        got.extend(sd.finish());
        assert_eq!(
            got,
            b"* OK ready\r\na1 LOGIN user pass\r\npartial line without newline"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
