/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Tri-state answer used for `configured` and `tls_ready`, serialized as
/// "yes"/"no"/"n/a" on the status socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tri {
    Yes,
    No,
    Na,
}

impl Tri {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tri::Yes => "yes",
            Tri::No => "no",
            Tri::Na => "n/a",
        }
    }
}

impl fmt::Display for Tri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Tri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "yes" => Ok(Tri::Yes),
            "no" => Ok(Tri::No),
            "n/a" => Ok(Tri::Na),
            other => Err(de::Error::custom(format!("invalid tri-state: {other}"))),
        }
    }
}

/// Major status of the citm daemon, shown to the user and used to derive
/// configured/tls_ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusMaj {
    NeedConf,
    TlsFirst,
    TlsRenew,
    TlsExpired,
    Ready,
    /// Running with a manually supplied cert/key; the daemon does not manage
    /// certificates, so configured/tls_ready are not applicable.
    ManualCert,
}

impl StatusMaj {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusMaj::NeedConf => "need conf",
            StatusMaj::TlsFirst => "tls first",
            StatusMaj::TlsRenew => "tls renew",
            StatusMaj::TlsExpired => "tls expired",
            StatusMaj::Ready => "ready",
            StatusMaj::ManualCert => "manual cert",
        }
    }

    pub fn configured(&self) -> Tri {
        match self {
            StatusMaj::NeedConf => Tri::No,
            StatusMaj::ManualCert => Tri::Na,
            _ => Tri::Yes,
        }
    }

    pub fn tls_ready(&self) -> Tri {
        match self {
            StatusMaj::NeedConf | StatusMaj::TlsFirst | StatusMaj::TlsExpired => Tri::No,
            StatusMaj::TlsRenew | StatusMaj::Ready => Tri::Yes,
            StatusMaj::ManualCert => Tri::Na,
        }
    }
}

impl fmt::Display for StatusMaj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minor status: the step of the certificate workflow currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StatusMin {
    #[default]
    None,
    CreateAccount,
    CreateOrder,
    GetAuthz,
    FinishOrder,
}

impl StatusMin {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusMin::None => "",
            StatusMin::CreateAccount => "create account",
            StatusMin::CreateOrder => "create order",
            StatusMin::GetAuthz => "get authz",
            StatusMin::FinishOrder => "finish order",
        }
    }
}

impl fmt::Display for StatusMin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full status packet, sent once when a status client connects. Field
/// order is part of the wire format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitmStatus {
    pub version_maj: u32,
    pub version_min: u32,
    pub version_patch: u32,
    pub major: String,
    pub minor: String,
    pub fulldomain: String,
    pub configured: Tri,
    pub tls_ready: Tri,
}

impl CitmStatus {
    pub fn new(
        version: (u32, u32, u32),
        maj: StatusMaj,
        min: StatusMin,
        fulldomain: impl Into<String>,
    ) -> Self {
        CitmStatus {
            version_maj: version.0,
            version_min: version.1,
            version_patch: version.2,
            major: maj.as_str().to_string(),
            minor: min.as_str().to_string(),
            fulldomain: fulldomain.into(),
            configured: maj.configured(),
            tls_ready: maj.tls_ready(),
        }
    }
}

/// The subset packet pushed to already-connected status clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub major: String,
    pub minor: String,
    pub fulldomain: String,
    pub configured: Tri,
    pub tls_ready: Tri,
}

impl StatusUpdate {
    pub fn new(maj: StatusMaj, min: StatusMin, fulldomain: impl Into<String>) -> Self {
        StatusUpdate {
            major: maj.as_str().to_string(),
            minor: min.as_str().to_string(),
            fulldomain: fulldomain.into(),
            configured: maj.configured(),
            tls_ready: maj.tls_ready(),
        }
    }

    /// Fold an update into a previously received full status.
    pub fn apply_to(&self, status: &mut CitmStatus) {
        status.major = self.major.clone();
        status.minor = self.minor.clone();
        status.fulldomain = self.fulldomain.clone();
        status.configured = self.configured;
        status.tls_ready = self.tls_ready;
    }
}
