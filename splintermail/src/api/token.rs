/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::Path;

use serde::{Deserialize, Serialize};

use sm_types::{Error, Result, ResultExt};

/// The on-disk API token: `${smdir}/api_token.json`. The nonce is
/// incremented and persisted before every call it authenticates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: u32,
    pub secret: String,
    pub nonce: u64,
}

impl ApiToken {
    pub fn read(path: &Path) -> Result<ApiToken> {
        let text = std::fs::read_to_string(path)
            .map_err(Error::from)
            .ctx(format!("reading {}", path.display()))?;
        let token: ApiToken = serde_json::from_str(&text)
            .map_err(Error::from)
            .ctx(format!("parsing {}", path.display()))?;
        Ok(token)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(Error::from)?;
        std::fs::write(path, text)
            .map_err(Error::from)
            .ctx(format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temppath() -> PathBuf {
        std::env::temp_dir().join(format!("sm-token-test-{:08x}.json", fastrand::u32(..)))
    }

    #[test]
    fn round_trip() {
        let path = temppath();
        let token = ApiToken {
            token: 12345,
            secret: "shhh".to_string(),
            nonce: 99,
        };
        token.write(&path).unwrap();
        assert_eq!(ApiToken::read(&path).unwrap(), token);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn accepts_the_original_format() {
        let path = temppath();
        std::fs::write(
            &path,
            "{ \"token\" : 1952398532,\n  \"secret\" : \"aaaabbbbccccdddd\",\n  \"nonce\"  : 18 }\n",
        )
        .unwrap();
        let token = ApiToken::read(&path).unwrap();
        assert_eq!(token.token, 1952398532);
        assert_eq!(token.secret, "aaaabbbbccccdddd");
        assert_eq!(token.nonce, 18);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_token_is_an_error() {
        let path = temppath();
        std::fs::write(&path, "{\"token\": \"not a number\"}").unwrap();
        assert!(ApiToken::read(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
