/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::sign::Signer;

use sm_types::{Result, ResultExt};

pub fn random_bytes(out: &mut [u8]) -> Result<()> {
    rand_bytes(out).ctx("RAND_bytes failed")?;
    Ok(())
}

pub fn random_u32() -> Result<u32> {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn random_u64() -> Result<u64> {
    let mut buf = [0u8; 8];
    random_bytes(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Protocol nonces reserve zero as a sentinel.
pub fn random_nonzero_u32() -> Result<u32> {
    loop {
        let v = random_u32()?;
        if v != 0 {
            return Ok(v);
        }
    }
}

/// HMAC-SHA-512, used to sign REST API request bodies.
pub fn hmac_sha512(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let key = PKey::hmac(secret)?;
    let mut signer = Signer::new(MessageDigest::sha512(), &key)?;
    signer.update(payload)?;
    Ok(signer.sign_to_vec()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha512(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn nonzero_is_nonzero() {
        for _ in 0..32 {
            assert_ne!(random_nonzero_u32().unwrap(), 0);
        }
    }
}
