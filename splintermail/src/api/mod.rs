/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The REST control API client: signed request payloads, the on-disk token
//! with its nonce discipline, and a minimal HTTPS POST executor. The full
//! HTTP machinery is deliberately thin; the interesting contract is the
//! payload and signature format.

mod token;
pub use token::ApiToken;

mod http;
pub use http::https_post;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use log::debug;
use serde_json::{json, Value};

use sm_crypto::hmac_sha512;
use sm_types::{Error, ErrorKind, Result, ResultExt};

use crate::config::Config;
use crate::opts::exit;

const TOKEN_FILE: &str = "api_token.json";

/// Build the signed request body: the JSON is base64-wrapped before signing
/// so the signature is stable across JSON re-serializers.
pub fn build_payload(command: &str, arg: Option<&str>, nonce: u64) -> String {
    let body = json!({
        "path": format!("/api/{command}"),
        "arg": arg,
        "nonce": nonce,
    });
    B64.encode(body.to_string())
}

/// The `X-AUTH-SIGNATURE` value for a payload.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String> {
    let mac = hmac_sha512(secret.as_bytes(), payload.as_bytes())?;
    Ok(hex::encode(mac))
}

enum Auth {
    Basic { user: String, password: String },
    Token(ApiToken),
}

pub fn api_main(config: &Config, command: &str, arg: Option<&str>) -> i32 {
    let token_path = config.splintermail_dir.join(TOKEN_FILE);

    let auth = match load_auth(config, &token_path) {
        Ok(auth) => auth,
        Err(code) => return code,
    };

    let (payload, headers) = match prepare_request(command, arg, &auth, &token_path) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to prepare API request: {e}");
            return exit::UNCAUGHT;
        }
    };

    let path = format!("/api/{command}");
    let (status, body) = match https_post(&config.api_server, &path, &headers, payload.as_bytes())
    {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("API request failed: {e}");
            return exit::UNCAUGHT;
        }
    };
    debug!("API response status {status}");

    if status == 401 {
        if matches!(auth, Auth::Token(_)) {
            eprintln!("the API token was rejected; delete {} to re-register", token_path.display());
            return exit::TOKEN_REJECTED;
        }
        eprintln!("bad credentials");
        return exit::API_FAILURE;
    }

    let response: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("unparsable API response: {e}");
            return exit::API_FAILURE;
        }
    };

    match response.get("status").and_then(Value::as_str) {
        Some("success") => {
            let contents = response.get("contents").unwrap_or(&Value::Null);
            match serde_json::to_string_pretty(contents) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{contents}"),
            }
            exit::OK
        }
        _ => {
            let reason = response
                .get("contents")
                .or_else(|| response.get("reason"))
                .unwrap_or(&Value::Null);
            eprintln!("API call failed: {reason}");
            exit::API_FAILURE
        }
    }
}

fn load_auth(config: &Config, token_path: &PathBuf) -> std::result::Result<Auth, i32> {
    if token_path.exists() {
        match ApiToken::read(token_path) {
            Ok(token) => return Ok(Auth::Token(token)),
            Err(e) => {
                // an unreadable token is useless; remove it and ask the
                // caller to retry from scratch
                eprintln!("api token is corrupted ({e}); deleting it");
                let _ = std::fs::remove_file(token_path);
                return Err(exit::TOKEN_CORRUPTED);
            }
        }
    }

    let Some(user) = config.user.clone() else {
        eprintln!("an account must be given with --user for API calls");
        return Err(exit::NO_USER);
    };
    let password = match prompt_password(&format!("password for {user}: ")) {
        Ok(password) => password,
        Err(e) => {
            eprintln!("failed to read password: {e}");
            return Err(exit::UNCAUGHT);
        }
    };
    Ok(Auth::Basic { user, password })
}

fn prepare_request(
    command: &str,
    arg: Option<&str>,
    auth: &Auth,
    token_path: &PathBuf,
) -> Result<(String, Vec<(String, String)>)> {
    match auth {
        Auth::Basic { user, password } => {
            let payload = build_payload(command, arg, 0);
            let basic = B64.encode(format!("{user}:{password}"));
            Ok((
                payload,
                vec![("Authorization".to_string(), format!("Basic {basic}"))],
            ))
        }
        Auth::Token(token) => {
            /* the nonce increments and persists before the request leaves,
               so a crash can never reuse a nonce */
            let mut token = token.clone();
            token.nonce += 1;
            token
                .write(token_path)
                .ctx("persisting the incremented nonce")?;

            let payload = build_payload(command, arg, token.nonce);
            let signature = sign_payload(&token.secret, &payload)?;
            Ok((
                payload,
                vec![
                    ("X-AUTH-TOKEN".to_string(), token.token.to_string()),
                    ("X-AUTH-SIGNATURE".to_string(), signature),
                ],
            ))
        }
    }
}

/// Read a password from the terminal. Used for basic-auth API calls; the
/// echo stays on, which the original tolerated on platforms without a tty
/// control API.
fn prompt_password(prompt: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    stderr
        .write_all(prompt.as_bytes())
        .and_then(|()| stderr.flush())
        .map_err(Error::from)?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(Error::from)?;
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(Error::new(ErrorKind::Password, "empty password"));
    }
    Ok(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_stable_base64() {
        let payload = build_payload("list_devices", None, 7);
        let decoded = B64.decode(&payload).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["path"], "/api/list_devices");
        assert_eq!(value["arg"], Value::Null);
        assert_eq!(value["nonce"], 7);

        // byte-identical for identical inputs, so signatures verify
        assert_eq!(payload, build_payload("list_devices", None, 7));
    }

    #[test]
    fn payload_carries_arg() {
        let payload = build_payload("delete_device", Some("somefingerprint"), 9);
        let decoded = B64.decode(&payload).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["arg"], "somefingerprint");
    }

    #[test]
    fn signature_matches_hmac_sha512() {
        let payload = build_payload("account_info", None, 1);
        let sig = sign_payload("secret", &payload).unwrap();
        // 512-bit mac in hex
        assert_eq!(sig.len(), 128);
        let again = sign_payload("secret", &payload).unwrap();
        assert_eq!(sig, again);
        let other = sign_payload("different", &payload).unwrap();
        assert_ne!(sig, other);
    }
}
