/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use sm_types::Result;

use crate::key::{Keypair, FINGERPRINT_LEN};

/// A key change broadcast to registered listeners.
#[derive(Clone, Debug)]
pub enum KeyEvent {
    Add(Keypair),
    Del([u8; FINGERPRINT_LEN]),
}

/// The shared set of device keys an account encrypts to. Listeners (one per
/// live citm user) receive every later add/delete so their encrypters stay
/// current.
pub struct Keyshare {
    keys: Vec<Keypair>,
    listeners: Vec<flume::Sender<KeyEvent>>,
}

impl Keyshare {
    pub fn new() -> Self {
        Keyshare {
            keys: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn keys(&self) -> &[Keypair] {
        &self.keys
    }

    pub fn add_key(&mut self, kp: Keypair) -> Result<()> {
        // replace any key with the same fingerprint
        self.keys.retain(|k| k.fingerprint() != kp.fingerprint());
        self.keys.push(kp.clone());
        self.listeners
            .retain(|tx| tx.send(KeyEvent::Add(kp.clone())).is_ok());
        Ok(())
    }

    pub fn del_key(&mut self, fingerprint: &[u8; FINGERPRINT_LEN]) {
        self.keys.retain(|k| k.fingerprint() != fingerprint);
        self.listeners
            .retain(|tx| tx.send(KeyEvent::Del(*fingerprint)).is_ok());
    }

    /// Register a listener; returns the current key set plus the stream of
    /// later changes.
    pub fn register(&mut self) -> (Vec<Keypair>, flume::Receiver<KeyEvent>) {
        let (tx, rx) = flume::unbounded();
        self.listeners.push(tx);
        (self.keys.clone(), rx)
    }
}

impl Default for Keyshare {
    fn default() -> Self {
        Keyshare::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_see_later_changes() {
        let mut share = Keyshare::new();
        let k1 = Keypair::generate(2048).unwrap();
        let k2 = Keypair::generate(2048).unwrap();
        share.add_key(k1.clone()).unwrap();

        let (initial, rx) = share.register();
        assert_eq!(initial.len(), 1);

        share.add_key(k2.clone()).unwrap();
        share.del_key(k1.fingerprint());

        match rx.try_recv().unwrap() {
            KeyEvent::Add(kp) => assert_eq!(kp, k2),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            KeyEvent::Del(fpr) => assert_eq!(&fpr, k1.fingerprint()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn same_fingerprint_replaces() {
        let mut share = Keyshare::new();
        let k1 = Keypair::generate(2048).unwrap();
        share.add_key(k1.clone()).unwrap();
        share.add_key(k1.clone()).unwrap();
        assert_eq!(share.keys().len(), 1);
    }
}
