/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;
use std::io;

/// The kind tag of a splintermail error. Branching code looks at the kind;
/// the trace is only ever shown to humans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoMem,
    FixedSize,
    Param,
    Value,
    Internal,
    Fs,
    Os,
    Conn,
    Sock,
    Ssl,
    Response,
    Token,
    Password,
    Not4Me,
    CertExp,
    SelfSign,
    Hostname,
    Canceled,
    Dead,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoMem => "NOMEM",
            ErrorKind::FixedSize => "FIXEDSIZE",
            ErrorKind::Param => "PARAM",
            ErrorKind::Value => "VALUE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Fs => "FS",
            ErrorKind::Os => "OS",
            ErrorKind::Conn => "CONN",
            ErrorKind::Sock => "SOCK",
            ErrorKind::Ssl => "SSL",
            ErrorKind::Response => "RESPONSE",
            ErrorKind::Token => "TOKEN",
            ErrorKind::Password => "PASSWORD",
            ErrorKind::Not4Me => "NOT4ME",
            ErrorKind::CertExp => "CERTEXP",
            ErrorKind::SelfSign => "SELFSIGN",
            ErrorKind::Hostname => "HOSTNAME",
            ErrorKind::Canceled => "CANCELED",
            ErrorKind::Dead => "DEAD",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error-as-value: a kind tag plus an append-only text trace. All fallible
/// splintermail operations return this; there are no panicking error paths
/// outside of tests.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    trace: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let mut trace = msg.into();
        if !trace.ends_with('\n') {
            trace.push('\n');
        }
        Error { kind, trace }
    }

    pub fn param(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Param, msg)
    }

    pub fn value(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Value, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, msg)
    }

    pub fn conn(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Conn, msg)
    }

    pub fn ssl(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Ssl, msg)
    }

    pub fn canceled() -> Self {
        Error::new(ErrorKind::Canceled, "canceled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    /// Append context to the trace, preserving the kind.
    pub fn ctx(mut self, msg: impl AsRef<str>) -> Self {
        self.trace.push_str(msg.as_ref());
        if !self.trace.ends_with('\n') {
            self.trace.push('\n');
        }
        self
    }

    /// Remap the kind while preserving the inner trace.
    pub fn rethrow(mut self, kind: ErrorKind, msg: impl AsRef<str>) -> Self {
        self.kind = kind;
        self.ctx(msg)
    }

    /// Merge `err` into `slot` with the session accumulation rule: the first
    /// error is primary, except that Canceled always yields to a more
    /// specific error. The loser's trace is appended to the winner's.
    pub fn merge(slot: &mut Option<Error>, err: Error) {
        match slot.take() {
            None => *slot = Some(err),
            Some(mut old) => {
                if old.kind == ErrorKind::Canceled && err.kind != ErrorKind::Canceled {
                    // the newer, more specific error takes over
                    let mut new = err;
                    new.trace.push_str(&old.trace);
                    *slot = Some(new);
                } else {
                    if err.kind != ErrorKind::Canceled {
                        old.trace.push_str(&err.trace);
                    }
                    *slot = Some(old);
                }
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.trace.trim_end())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.trace.trim_end())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Conn,
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorKind::Fs,
            io::ErrorKind::OutOfMemory => ErrorKind::NoMem,
            _ => ErrorKind::Os,
        };
        Error::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::Param, e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::new(ErrorKind::Ssl, e.to_string())
    }
}

/// PROP/RETHROW-style propagation on Result values.
pub trait ResultExt<T> {
    fn ctx(self, msg: impl AsRef<str>) -> Result<T>;
    fn rethrow(self, kind: ErrorKind, msg: impl AsRef<str>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn ctx(self, msg: impl AsRef<str>) -> Result<T> {
        self.map_err(|e| e.into().ctx(msg))
    }

    fn rethrow(self, kind: ErrorKind, msg: impl AsRef<str>) -> Result<T> {
        self.map_err(|e| e.into().rethrow(kind, msg))
    }
}
