/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use openssl::ssl::{Ssl, SslContext, SslFiletype, SslMethod, SslRef, SslVerifyMode};
use openssl::x509::verify::X509CheckFlags;
use openssl::x509::X509;

use sm_types::{Error, ErrorKind, Result, ResultExt};

/// A shared SSL context, built once per listener or upstream target and
/// reused by every session.
#[derive(Clone)]
pub struct TlsContext {
    inner: Arc<SslContext>,
}

impl TlsContext {
    /// A verifying client context trusting the platform store.
    pub fn client() -> Result<TlsContext> {
        let mut builder = SslContext::builder(SslMethod::tls_client())?;
        builder.set_default_verify_paths()?;
        builder.set_verify(SslVerifyMode::PEER);
        Ok(TlsContext {
            inner: Arc::new(builder.build()),
        })
    }

    /// A verifying client context trusting exactly the given root.
    pub fn client_with_root_pem(pem: &[u8]) -> Result<TlsContext> {
        let mut builder = SslContext::builder(SslMethod::tls_client())?;
        let root = X509::from_pem(pem).rethrow(ErrorKind::Param, "bad trust root")?;
        builder.cert_store_mut().add_cert(root)?;
        builder.set_verify(SslVerifyMode::PEER);
        Ok(TlsContext {
            inner: Arc::new(builder.build()),
        })
    }

    /// A server context from a cert/key pair on disk. An unpaired cert and
    /// key is rejected here, before any listener starts.
    pub fn server(cert: &Path, key: &Path) -> Result<TlsContext> {
        let mut builder = SslContext::builder(SslMethod::tls_server())?;
        builder
            .set_certificate_chain_file(cert)
            .ctx(format!("loading certificate {}", cert.display()))?;
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .ctx(format!("loading key {}", key.display()))?;
        builder
            .check_private_key()
            .rethrow(ErrorKind::Param, "certificate and key do not pair")?;
        Ok(TlsContext {
            inner: Arc::new(builder.build()),
        })
    }

    /// A server context from in-memory PEM material.
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsContext> {
        use openssl::pkey::PKey;

        let mut builder = SslContext::builder(SslMethod::tls_server())?;
        let cert = X509::from_pem(cert_pem).rethrow(ErrorKind::Param, "bad certificate")?;
        let key = PKey::private_key_from_pem(key_pem).rethrow(ErrorKind::Param, "bad key")?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder
            .check_private_key()
            .rethrow(ErrorKind::Param, "certificate and key do not pair")?;
        Ok(TlsContext {
            inner: Arc::new(builder.build()),
        })
    }

    /// A per-session SSL handle. Client (upwards) handles verify the peer
    /// name; server (downwards) handles wait for a ClientHello.
    pub(crate) fn new_ssl(&self, upwards: bool, verify_name: Option<&str>) -> Result<Ssl> {
        let mut ssl = Ssl::new(&self.inner)?;
        if let Some(name) = verify_name {
            let param = ssl.param_mut();
            param.set_hostflags(X509CheckFlags::NO_PARTIAL_WILDCARDS);
            match name.parse::<IpAddr>() {
                Ok(ip) => param.set_ip(ip)?,
                Err(_) => param.set_host(name)?,
            }
        }
        if upwards {
            ssl.set_connect_state();
        } else {
            ssl.set_accept_state();
        }
        Ok(ssl)
    }
}

/// Turn an OpenSSL failure into the kind callers branch on: certificate
/// expiry, untrusted chain, and hostname mismatch each get their own kind.
pub(crate) fn map_ssl_failure(ssl: &SslRef, context: &str) -> Error {
    let vr = ssl.verify_result().as_raw();
    let kind = match vr {
        openssl_sys::X509_V_ERR_CERT_HAS_EXPIRED | openssl_sys::X509_V_ERR_CERT_NOT_YET_VALID => {
            ErrorKind::CertExp
        }
        openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
        | openssl_sys::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
        | openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT
        | openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        | openssl_sys::X509_V_ERR_CERT_UNTRUSTED => ErrorKind::SelfSign,
        openssl_sys::X509_V_ERR_HOSTNAME_MISMATCH => ErrorKind::Hostname,
        _ => ErrorKind::Ssl,
    };
    Error::new(kind, format!("{context} (verify result {vr})"))
}
