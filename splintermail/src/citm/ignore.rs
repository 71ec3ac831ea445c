/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use sm_types::{Error, Result, ResultExt};

const IGNORE_FILE: &str = "ignore.json";

struct Entry {
    uid: String,
    seen: bool,
}

/// The persistent set of message UIDs encrypted to some other device.
/// Loading marks every entry unseen; only entries seen again (or newly
/// added) survive the next write, so stale UIDs prune themselves.
pub struct IgnoreList {
    entries: Vec<Entry>,
}

impl IgnoreList {
    /// Load `ignore.json` from the user directory. A missing or unreadable
    /// file just means an empty list.
    pub fn load(userdir: &Path) -> IgnoreList {
        let path = userdir.join(IGNORE_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                return IgnoreList {
                    entries: Vec::new(),
                }
            }
        };
        let uids: Vec<String> = match serde_json::from_str(&text) {
            Ok(uids) => uids,
            Err(e) => {
                warn!("unable to parse {}: {e}", path.display());
                Vec::new()
            }
        };
        IgnoreList {
            entries: uids
                .into_iter()
                .map(|uid| Entry { uid, seen: false })
                .collect(),
        }
    }

    /// Whether this UID is known not-for-us; a hit marks the entry seen so
    /// it survives pruning.
    pub fn should_ignore(&mut self, uid: &str) -> bool {
        for entry in &mut self.entries {
            if entry.uid == uid {
                entry.seen = true;
                return true;
            }
        }
        false
    }

    pub fn add(&mut self, uid: &str) {
        if self.entries.iter().any(|e| e.uid == uid) {
            return;
        }
        self.entries.push(Entry {
            uid: uid.to_string(),
            seen: true,
        });
    }

    /// Persist only the seen entries.
    pub fn write(&self, userdir: &Path) -> Result<()> {
        let uids: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| e.seen)
            .map(|e| e.uid.as_str())
            .collect();
        let text = serde_json::to_string(&uids).map_err(Error::from)?;
        std::fs::write(userdir.join(IGNORE_FILE), text)
            .map_err(Error::from)
            .ctx("writing ignore.json")
    }
}

/// Thread-safe handle shared between relay sessions of one user.
pub struct SharedIgnoreList {
    userdir: PathBuf,
    list: Mutex<IgnoreList>,
}

impl SharedIgnoreList {
    pub fn load(userdir: impl Into<PathBuf>) -> SharedIgnoreList {
        let userdir = userdir.into();
        let list = IgnoreList::load(&userdir);
        SharedIgnoreList {
            userdir,
            list: Mutex::new(list),
        }
    }

    pub fn should_ignore(&self, uid: &str) -> bool {
        self.list.lock().unwrap().should_ignore(uid)
    }

    /// Record a not-for-us UID and persist immediately.
    pub fn add(&self, uid: &str) {
        let mut list = self.list.lock().unwrap();
        list.add(uid);
        if let Err(e) = list.write(&self.userdir) {
            warn!("failed to persist ignore list: {e}");
        }
    }

    pub fn flush(&self) {
        let list = self.list.lock().unwrap();
        if let Err(e) = list.write(&self.userdir) {
            warn!("failed to persist ignore list: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sm-ignore-test-{:08x}", fastrand::u32(..)));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_add_write_round_trip() {
        let dir = tempdir();

        let mut list = IgnoreList::load(&dir);
        assert!(!list.should_ignore("uid1"));
        list.add("uid1");
        list.add("uid2");
        list.write(&dir).unwrap();

        let mut list = IgnoreList::load(&dir);
        assert!(list.should_ignore("uid1"));
        assert!(!list.should_ignore("nope"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unseen_entries_prune_on_write() {
        let dir = tempdir();

        let mut list = IgnoreList::load(&dir);
        list.add("keep");
        list.add("drop");
        list.write(&dir).unwrap();

        // a new load starts everything unseen; only touched entries persist
        let mut list = IgnoreList::load(&dir);
        assert!(list.should_ignore("keep"));
        list.write(&dir).unwrap();

        let mut list = IgnoreList::load(&dir);
        assert!(list.should_ignore("keep"));
        assert!(!list.should_ignore("drop"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempdir();
        std::fs::write(dir.join(IGNORE_FILE), b"{not json").unwrap();
        let mut list = IgnoreList::load(&dir);
        assert!(!list.should_ignore("anything"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
