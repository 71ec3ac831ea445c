/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Insecure,
    StartTls,
    Tls,
}

impl Scheme {
    pub fn needs_tls(&self) -> bool {
        !matches!(self, Scheme::Insecure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Insecure => "insecure",
            Scheme::StartTls => "starttls",
            Scheme::Tls => "tls",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListenerSpec {
    pub scheme: Scheme,
    pub addr: SocketAddr,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ListenerParseError {
    BadScheme(String),
    BadAddr(String),
}

impl fmt::Display for ListenerParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerParseError::BadScheme(s) => {
                write!(f, "invalid listener scheme in \"{s}\"")
            }
            ListenerParseError::BadAddr(s) => {
                write!(f, "invalid listener address in \"{s}\"")
            }
        }
    }
}

impl ListenerSpec {
    /// Parse `SCHEME://HOST:PORT`.
    pub fn parse(spec: &str) -> Result<ListenerSpec, ListenerParseError> {
        let Some((scheme, rest)) = spec.split_once("://") else {
            return Err(ListenerParseError::BadScheme(spec.to_string()));
        };
        let scheme = match scheme {
            "insecure" => Scheme::Insecure,
            "starttls" => Scheme::StartTls,
            "tls" => Scheme::Tls,
            _ => return Err(ListenerParseError::BadScheme(spec.to_string())),
        };
        let addr = rest
            .parse::<SocketAddr>()
            .map_err(|_| ListenerParseError::BadAddr(spec.to_string()))?;
        Ok(ListenerSpec { scheme, addr })
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.addr)
    }
}
