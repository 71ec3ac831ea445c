/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::sync::{Arc, Mutex};

use log::debug;

use sm_crypto::Keypair;
use sm_engine::{LogicOut, Session, SessionLogic};
use sm_types::Result;

use crate::citm::{SharedIgnoreList, StreamDecrypter};

/// State shared between the two halves of one relayed connection: the
/// downwards session (to the mail client) and the upwards session (to the
/// remote server).
pub struct RelayShared {
    down: Mutex<Option<Arc<Session>>>,
    up: Mutex<Option<Arc<Session>>>,
}

impl RelayShared {
    pub fn new() -> Arc<RelayShared> {
        Arc::new(RelayShared {
            down: Mutex::new(None),
            up: Mutex::new(None),
        })
    }

    pub fn set_down(&self, session: &Arc<Session>) {
        *self.down.lock().unwrap() = Some(session.clone());
    }

    pub fn set_up(&self, session: &Arc<Session>) {
        *self.up.lock().unwrap() = Some(session.clone());
    }

    fn down(&self) -> Option<Arc<Session>> {
        self.down.lock().unwrap().clone()
    }

    fn up(&self) -> Option<Arc<Session>> {
        self.up.lock().unwrap().clone()
    }

    /// One side failed or finished; both sessions come down together.
    fn close_both(&self, out: &mut LogicOut) {
        if let Some(down) = self.down() {
            out.close(&down, None);
        }
        if let Some(up) = self.up() {
            out.close(&up, None);
        }
    }

    /// Close both sessions immediately and drop the pairing; for contexts
    /// outside the imap engine (session destroy callbacks).
    pub fn shutdown(&self) {
        let down = self.down.lock().unwrap().take();
        let up = self.up.lock().unwrap().take();
        if let Some(down) = down {
            down.close(None);
        }
        if let Some(up) = up {
            up.close(None);
        }
    }
}

/// The greeting we owe the mail client; the remote server's own greeting is
/// consumed by the upwards half instead of being relayed.
pub const RELAY_GREETING: &[u8] = b"* OK splintermail citm ready, greetings, friend\r\n";

/// Controller for the downwards session: client bytes relay straight to the
/// server.
pub struct RelayDown {
    shared: Arc<RelayShared>,
    session: Arc<Session>,
    greet: bool,
}

impl RelayDown {
    /// With `greet`, the relay issues its own greeting on start (tls and
    /// insecure listeners); the starttls gate greets for itself.
    pub fn new(shared: Arc<RelayShared>, session: Arc<Session>, greet: bool) -> RelayDown {
        RelayDown {
            shared,
            session,
            greet,
        }
    }
}

impl SessionLogic for RelayDown {
    fn on_start(&mut self, out: &mut LogicOut) {
        if self.greet {
            out.write(&self.session, RELAY_GREETING);
        }
    }

    fn on_read(&mut self, data: &[u8], out: &mut LogicOut) -> Result<()> {
        if let Some(up) = self.shared.up() {
            out.write(&up, data);
        }
        Ok(())
    }

    fn on_eof(&mut self, out: &mut LogicOut) {
        debug!("client sent EOF, closing the relay");
        self.shared.close_both(out);
    }
}

/// Controller for the upwards session: server bytes pass through the stream
/// decrypter before heading back to the client.
pub struct RelayUp {
    shared: Arc<RelayShared>,
    decrypter: StreamDecrypter,
    greeting: Option<Vec<u8>>,
}

impl RelayUp {
    pub fn new(
        shared: Arc<RelayShared>,
        keypair: Keypair,
        ignore: Arc<SharedIgnoreList>,
    ) -> RelayUp {
        RelayUp {
            decrypter: StreamDecrypter::new(keypair, ignore),
            shared,
            greeting: Some(Vec::new()),
        }
    }
}

impl SessionLogic for RelayUp {
    fn on_start(&mut self, _out: &mut LogicOut) {}

    fn on_read(&mut self, data: &[u8], out: &mut LogicOut) -> Result<()> {
        let mut data = data;
        if let Some(greeting) = &mut self.greeting {
            // the remote's greeting is ours to consume, not to relay
            match data.iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    greeting.extend_from_slice(&data[..nl]);
                    debug!(
                        "upstream greeting: {}",
                        String::from_utf8_lossy(greeting).trim_end()
                    );
                    self.greeting = None;
                    data = &data[nl + 1..];
                }
                None => {
                    greeting.extend_from_slice(data);
                    return Ok(());
                }
            }
        }
        let plain = self.decrypter.feed(data);
        if let Some(down) = self.shared.down() {
            out.write(&down, &plain);
        }
        Ok(())
    }

    fn on_eof(&mut self, out: &mut LogicOut) {
        debug!("server sent EOF, closing the relay");
        let tail = self.decrypter.finish();
        if let Some(down) = self.shared.down() {
            out.write(&down, &tail);
        }
        self.shared.close_both(out);
    }
}
