/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The pre-TLS command gate for starttls listeners: a minimal IMAP surface
//! (CAPABILITY, NOOP, LOGOUT, STARTTLS) that refuses everything sensitive
//! until the connection is upgraded, then hands off to the relay.

use std::sync::Arc;

use sm_engine::{LogicOut, Session, SessionLogic};
use sm_types::Result;

pub const GREETING: &[u8] =
    b"* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] splintermail citm ready, greetings, friend\r\n";

pub struct StartTlsGate<L: SessionLogic> {
    session: Arc<Session>,
    upgrade: Option<Box<dyn FnOnce() + Send>>,
    inner: L,
    upgraded: bool,
    line: Vec<u8>,
}

impl<L: SessionLogic> StartTlsGate<L> {
    pub fn new(
        session: Arc<Session>,
        upgrade: impl FnOnce() + Send + 'static,
        inner: L,
    ) -> StartTlsGate<L> {
        StartTlsGate {
            session,
            upgrade: Some(Box::new(upgrade)),
            inner,
            upgraded: false,
            line: Vec::new(),
        }
    }

    fn handle_line(&mut self, line: &[u8], out: &mut LogicOut) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        let mut words = text.split_whitespace();
        let Some(tag) = words.next() else {
            out.write(&self.session, b"* BAD empty command\r\n");
            return;
        };
        let command = words.next().unwrap_or("").to_ascii_uppercase();

        match command.as_str() {
            "CAPABILITY" => {
                out.write(
                    &self.session,
                    b"* CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED\r\n",
                );
                out.write(
                    &self.session,
                    format!("{tag} OK CAPABILITY completed\r\n").as_bytes(),
                );
            }
            "NOOP" => {
                out.write(&self.session, format!("{tag} OK NOOP completed\r\n").as_bytes());
            }
            "LOGOUT" => {
                out.write(&self.session, b"* BYE logging out\r\n");
                out.write(
                    &self.session,
                    format!("{tag} OK LOGOUT completed\r\n").as_bytes(),
                );
                out.close(&self.session, None);
            }
            "STARTTLS" => {
                out.write(
                    &self.session,
                    format!("{tag} OK begin TLS negotiation\r\n").as_bytes(),
                );
                if let Some(upgrade) = self.upgrade.take() {
                    /* deferred so the OK leaves in plaintext ahead of the
                       handshake */
                    out.defer(upgrade);
                }
                self.upgraded = true;
            }
            _ => {
                out.write(
                    &self.session,
                    format!("{tag} BAD run STARTTLS first\r\n").as_bytes(),
                );
            }
        }
    }
}

impl<L: SessionLogic> SessionLogic for StartTlsGate<L> {
    fn on_start(&mut self, out: &mut LogicOut) {
        out.write(&self.session, GREETING);
    }

    fn on_read(&mut self, data: &[u8], out: &mut LogicOut) -> Result<()> {
        if self.upgraded {
            return self.inner.on_read(data, out);
        }

        self.line.extend_from_slice(data);
        while let Some(nl) = self.line.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line.drain(..=nl).collect();
            self.handle_line(&line, out);
            if self.upgraded {
                // anything buffered beyond STARTTLS belongs to the TLS layer
                self.line.clear();
                break;
            }
        }
        Ok(())
    }

    fn on_eof(&mut self, out: &mut LogicOut) {
        self.inner.on_eof(out);
    }
}
