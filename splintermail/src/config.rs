/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The splintermail config file: one `KEY VALUE` (or bare `KEY`) per line,
//! `#` comments. Later sources override earlier ones, and the command line
//! overrides all of them.

use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN: &str = "starttls://127.0.0.1:1993";
pub const DEFAULT_STATUS_SOCK: &str = "/var/run/splintermail/citm.sock";
pub const DEFAULT_SM_DIR: &str = "/var/lib/splintermail";
pub const DEFAULT_REMOTE_IMAP: &str = "splintermail.com:993";
pub const DEFAULT_API_SERVER: &str = "splintermail.com:443";

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub socket: PathBuf,
    pub splintermail_dir: PathBuf,
    pub logfile: Option<PathBuf>,
    pub listen: Vec<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub user: Option<String>,
    pub account_dir: Option<PathBuf>,
    pub remote_imap: String,
    pub api_server: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            socket: PathBuf::from(DEFAULT_STATUS_SOCK),
            splintermail_dir: PathBuf::from(DEFAULT_SM_DIR),
            logfile: None,
            listen: Vec::new(),
            cert: None,
            key: None,
            user: None,
            account_dir: None,
            remote_imap: DEFAULT_REMOTE_IMAP.to_string(),
            api_server: DEFAULT_API_SERVER.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    path: PathBuf,
    detail: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config file {}: {}", self.path.display(), self.detail)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load the merged configuration. With an explicit path only that file
    /// is read, and failing to read it is an error; the standard locations
    /// are each optional.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = explicit {
            let text = std::fs::read_to_string(path).map_err(|e| ConfigError {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            config.apply_text(path, &text)?;
            return Ok(config);
        }

        for path in default_config_paths() {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(_) => continue,
            };
            config.apply_text(&path, &text)?;
        }
        Ok(config)
    }

    pub fn apply_text(&mut self, path: &Path, text: &str) -> Result<(), ConfigError> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            self.apply_kv(key, value).map_err(|detail| ConfigError {
                path: path.to_path_buf(),
                detail: format!("line {}: {detail}", lineno + 1),
            })?;
        }
        Ok(())
    }

    fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), String> {
        let need = |value: &str| -> Result<String, String> {
            if value.is_empty() {
                Err(format!("option {key} needs a value"))
            } else {
                Ok(value.to_string())
            }
        };
        match key {
            "debug" => self.debug = true,
            "socket" => self.socket = PathBuf::from(need(value)?),
            "splintermail-dir" => self.splintermail_dir = PathBuf::from(need(value)?),
            "logfile" => self.logfile = Some(PathBuf::from(need(value)?)),
            "no-logfile" => self.logfile = None,
            "listen" => self.listen.push(need(value)?),
            "cert" => self.cert = Some(PathBuf::from(need(value)?)),
            "key" => self.key = Some(PathBuf::from(need(value)?)),
            "user" => self.user = Some(need(value)?),
            "account-dir" => self.account_dir = Some(PathBuf::from(need(value)?)),
            "remote-imap" => self.remote_imap = need(value)?,
            "api-server" => self.api_server = need(value)?,
            other => return Err(format!("unrecognized option {other}")),
        }
        Ok(())
    }

    /// The listener specs to serve, with the documented default.
    pub fn listeners(&self) -> Vec<String> {
        if self.listen.is_empty() {
            vec![DEFAULT_LISTEN.to_string()]
        } else {
            self.listen.clone()
        }
    }

    /// Render the effective configuration in config-file syntax.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        if self.debug {
            out.push_str("debug\n");
        }
        out.push_str(&format!("socket {}\n", self.socket.display()));
        out.push_str(&format!(
            "splintermail-dir {}\n",
            self.splintermail_dir.display()
        ));
        match &self.logfile {
            Some(path) => out.push_str(&format!("logfile {}\n", path.display())),
            None => out.push_str("no-logfile\n"),
        }
        for listen in self.listeners() {
            out.push_str(&format!("listen {listen}\n"));
        }
        if let Some(cert) = &self.cert {
            out.push_str(&format!("cert {}\n", cert.display()));
        }
        if let Some(key) = &self.key {
            out.push_str(&format!("key {}\n", key.display()));
        }
        if let Some(user) = &self.user {
            out.push_str(&format!("user {user}\n"));
        }
        if let Some(dir) = &self.account_dir {
            out.push_str(&format!("account-dir {}\n", dir.display()));
        }
        out.push_str(&format!("remote-imap {}\n", self.remote_imap));
        out.push_str(&format!("api-server {}\n", self.api_server));
        out
    }

    /// The per-account state directory: explicit override, or
    /// `${splintermail_dir}/<user>`.
    pub fn account_dir_for(&self, user: &str) -> PathBuf {
        match &self.account_dir {
            Some(dir) => dir.clone(),
            None => self.splintermail_dir.join(user),
        }
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/splintermail.conf")];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".splintermail.conf"));
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("splintermail.conf"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_override() {
        let mut config = Config::default();
        config
            .apply_text(
                Path::new("a.conf"),
                "# a comment\n\
                 debug\n\
                 socket /tmp/a.sock\n\
                 listen tls://0.0.0.0:993\n",
            )
            .unwrap();
        config
            .apply_text(Path::new("b.conf"), "socket /tmp/b.sock\n")
            .unwrap();

        assert!(config.debug);
        // later sources override earlier ones
        assert_eq!(config.socket, PathBuf::from("/tmp/b.sock"));
        // listeners accumulate
        assert_eq!(config.listen, vec!["tls://0.0.0.0:993".to_string()]);
    }

    #[test]
    fn default_listener_applies() {
        let config = Config::default();
        assert_eq!(config.listeners(), vec![DEFAULT_LISTEN.to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_text(Path::new("x.conf"), "frobnicate yes\n")
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized option"));
    }

    #[test]
    fn missing_values_are_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_text(Path::new("x.conf"), "socket\n")
            .unwrap_err();
        assert!(err.to_string().contains("needs a value"));
    }

    #[test]
    fn dump_round_trips() {
        let mut config = Config::default();
        config
            .apply_text(
                Path::new("a.conf"),
                "debug\nuser me@splintermail.com\nlisten insecure://127.0.0.1:1143\n",
            )
            .unwrap();
        let dumped = config.dump();

        let mut reparsed = Config::default();
        reparsed.apply_text(Path::new("dump"), &dumped).unwrap();
        assert_eq!(reparsed.user.as_deref(), Some("me@splintermail.com"));
        assert!(reparsed.debug);
        assert_eq!(reparsed.listen, vec!["insecure://127.0.0.1:1143"]);
    }
}
