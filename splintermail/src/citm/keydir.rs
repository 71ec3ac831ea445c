/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::PathBuf;

use log::info;

use sm_crypto::Keypair;
use sm_types::{Error, Result, ResultExt};

const DEVICE_KEY_FILE: &str = "device.pem";
const PEER_KEY_DIR: &str = "keys";
const DEVICE_KEY_BITS: u32 = 4096;

/// The per-account key material on disk: this device's RSA keypair plus the
/// public keys of the account's other devices.
pub struct KeyDir {
    dir: PathBuf,
    device: Keypair,
}

impl KeyDir {
    /// Open the key directory, generating a device key on first use.
    pub fn open(dir: impl Into<PathBuf>) -> Result<KeyDir> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(Error::from)
            .ctx("creating account directory")?;

        let key_path = dir.join(DEVICE_KEY_FILE);
        let device = if key_path.exists() {
            Keypair::load_private(&key_path)?
        } else {
            info!("generating a new device key at {}", key_path.display());
            Keypair::generate_to_file(DEVICE_KEY_BITS, &key_path)?
        };

        Ok(KeyDir { dir, device })
    }

    pub fn device(&self) -> &Keypair {
        &self.device
    }

    /// Store a peer device's public key, named by fingerprint.
    pub fn store_peer_key(&self, pem: &[u8]) -> Result<Keypair> {
        let kp = Keypair::from_public_pem(pem)?;
        let peer_dir = self.dir.join(PEER_KEY_DIR);
        std::fs::create_dir_all(&peer_dir)
            .map_err(Error::from)
            .ctx("creating peer key directory")?;
        let path = peer_dir.join(format!("{}.pem", kp.hex_fingerprint()));
        std::fs::write(&path, pem)
            .map_err(Error::from)
            .ctx("writing peer key")?;
        Ok(kp)
    }

    /// All keys mail should be encrypted to: every stored peer key plus our
    /// own device key.
    pub fn all_keys(&self) -> Result<Vec<Keypair>> {
        let mut keys = vec![self.device.clone()];
        let peer_dir = self.dir.join(PEER_KEY_DIR);
        let entries = match std::fs::read_dir(&peer_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(keys),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "pem").unwrap_or(false) {
                let pem = std::fs::read(&path).map_err(Error::from)?;
                let kp = Keypair::from_public_pem(&pem)
                    .ctx(format!("loading peer key {}", path.display()))?;
                if kp.fingerprint() != self.device.fingerprint() {
                    keys.push(kp);
                }
            }
        }
        Ok(keys)
    }
}
