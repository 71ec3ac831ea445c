/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;

use sm_types::{Error, ErrorKind, Result, ResultExt};

/// Length of a key fingerprint (SHA-256, binary).
pub const FINGERPRINT_LEN: usize = 32;

enum KeyMaterial {
    Private(PKey<Private>),
    Public(PKey<Public>),
}

struct Inner {
    key: KeyMaterial,
    fingerprint: [u8; FINGERPRINT_LEN],
}

/// A key handle with shared backing storage: cloning a `Keypair` shares the
/// underlying key material and fingerprint.
///
/// The fingerprint is the SHA-256 digest over the DER encoding of the public
/// key as it appears inside an X.509 certificate's subjectPublicKey bit
/// string (for RSA keys, the PKCS#1 `RSAPublicKey` structure). Wire
/// compatibility depends on this exact choice.
#[derive(Clone)]
pub struct Keypair {
    inner: Arc<Inner>,
}

fn compute_fingerprint(material: &KeyMaterial) -> Result<[u8; FINGERPRINT_LEN]> {
    let der = match material {
        KeyMaterial::Private(k) => match k.rsa() {
            Ok(rsa) => rsa.public_key_to_der_pkcs1()?,
            Err(_) => k.public_key_to_der()?,
        },
        KeyMaterial::Public(k) => match k.rsa() {
            Ok(rsa) => rsa.public_key_to_der_pkcs1()?,
            Err(_) => k.public_key_to_der()?,
        },
    };
    let digest = hash(MessageDigest::sha256(), &der)?;
    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

impl Keypair {
    fn new(key: KeyMaterial) -> Result<Self> {
        let fingerprint = compute_fingerprint(&key)?;
        Ok(Keypair {
            inner: Arc::new(Inner { key, fingerprint }),
        })
    }

    /// Generate a fresh RSA private key.
    pub fn generate(bits: u32) -> Result<Self> {
        let rsa = Rsa::generate(bits)?;
        let pkey = PKey::from_rsa(rsa)?;
        Keypair::new(KeyMaterial::Private(pkey))
    }

    pub fn from_private_pem(pem: &[u8]) -> Result<Self> {
        let pkey = PKey::private_key_from_pem(pem)
            .map_err(|e| Error::param(format!("failed to read private key: {e}")))?;
        Keypair::new(KeyMaterial::Private(pkey))
    }

    /// Read a public key from PEM. A private key PEM is accepted too, since
    /// it contains the public half.
    pub fn from_public_pem(pem: &[u8]) -> Result<Self> {
        match PKey::public_key_from_pem(pem) {
            Ok(pkey) => Keypair::new(KeyMaterial::Public(pkey)),
            Err(pub_err) => match PKey::private_key_from_pem(pem) {
                Ok(pkey) => Keypair::new(KeyMaterial::Private(pkey)),
                Err(_) => Err(Error::param(format!(
                    "failed to read public key: {pub_err}"
                ))),
            },
        }
    }

    pub fn load_private(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path)
            .map_err(Error::from)
            .ctx(format!("reading {}", path.display()))?;
        Keypair::from_private_pem(&pem).ctx(format!("loading {}", path.display()))
    }

    pub fn load_public(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path)
            .map_err(Error::from)
            .ctx(format!("reading {}", path.display()))?;
        Keypair::from_public_pem(&pem).ctx(format!("loading {}", path.display()))
    }

    /// Write a freshly generated private key to `path` in PEM form.
    pub fn generate_to_file(bits: u32, path: impl AsRef<Path>) -> Result<Self> {
        let kp = Keypair::generate(bits)?;
        let pem = kp.private_pem()?;
        fs::write(path.as_ref(), pem)
            .map_err(Error::from)
            .rethrow(ErrorKind::Fs, "writing private key")?;
        Ok(kp)
    }

    pub fn fingerprint(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.inner.fingerprint
    }

    pub fn hex_fingerprint(&self) -> String {
        hex::encode(self.inner.fingerprint)
    }

    pub fn has_private(&self) -> bool {
        matches!(self.inner.key, KeyMaterial::Private(_))
    }

    pub fn public_pem(&self) -> Result<Vec<u8>> {
        let pem = match &self.inner.key {
            KeyMaterial::Private(k) => k.public_key_to_pem()?,
            KeyMaterial::Public(k) => k.public_key_to_pem()?,
        };
        Ok(pem)
    }

    pub fn private_pem(&self) -> Result<Vec<u8>> {
        match &self.inner.key {
            KeyMaterial::Private(k) => Ok(k.private_key_to_pem_pkcs8()?),
            KeyMaterial::Public(_) => Err(Error::param("keypair has no private key")),
        }
    }

    /// RSA modulus size in bytes, which bounds the wrapped-key length.
    pub fn size(&self) -> Result<usize> {
        let size = match &self.inner.key {
            KeyMaterial::Private(k) => k.size(),
            KeyMaterial::Public(k) => k.size(),
        };
        Ok(size)
    }

    pub(crate) fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        use openssl::encrypt::Encrypter;
        use openssl::rsa::Padding;

        let mut enc = match &self.inner.key {
            KeyMaterial::Private(k) => Encrypter::new(k)?,
            KeyMaterial::Public(k) => Encrypter::new(k)?,
        };
        enc.set_rsa_padding(Padding::PKCS1)?;
        let mut out = vec![0u8; enc.encrypt_len(key)?];
        let n = enc.encrypt(key, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    pub(crate) fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        use openssl::encrypt::Decrypter;
        use openssl::rsa::Padding;

        let KeyMaterial::Private(pkey) = &self.inner.key else {
            return Err(Error::param("cannot decrypt without a private key"));
        };
        let mut dec = Decrypter::new(pkey)?;
        dec.set_rsa_padding(Padding::PKCS1)?;
        let mut out = vec![0u8; dec.decrypt_len(wrapped)?];
        let n = dec
            .decrypt(wrapped, &mut out)
            .map_err(|e| Error::ssl(format!("failed to unwrap message key: {e}")))?;
        out.truncate(n);
        Ok(out)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.hex_fingerprint())
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for Keypair {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_pem_round_trip() {
        let kp = Keypair::generate(2048).unwrap();
        let public = Keypair::from_public_pem(&kp.public_pem().unwrap()).unwrap();
        assert_eq!(kp.fingerprint(), public.fingerprint());
        assert!(!public.has_private());
    }

    #[test]
    fn public_pem_accepts_private_key() {
        let kp = Keypair::generate(2048).unwrap();
        let pem = kp.private_pem().unwrap();
        let loaded = Keypair::from_public_pem(&pem).unwrap();
        assert_eq!(kp.fingerprint(), loaded.fingerprint());
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let kp = Keypair::generate(2048).unwrap();
        let key = [0x42u8; 32];
        let wrapped = kp.wrap_key(&key).unwrap();
        assert_ne!(wrapped.as_slice(), &key[..]);
        let unwrapped = kp.unwrap_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), &key[..]);
    }
}
