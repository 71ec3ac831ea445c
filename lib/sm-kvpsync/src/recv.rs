/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::VecDeque;

use foldhash::{HashMap, HashMapExt};

use sm_crypto::random_nonzero_u32;
use sm_types::Result;

use crate::pkts::{Ack, Update, UpdateBody};
use crate::GC_DELAY;

/* Updates arrive out of order, so deletions are tracked as datums rather
   than executed as actions: a delete annihilates the insert whose update_id
   matches its delete_id, and the annihilation is remembered for GC_DELAY so
   a late duplicate of the insert cannot resurrect the value. */
#[derive(Debug)]
struct Datum {
    sync_id: u32,
    update_id: u32,
    delete_id: u32, // nonzero means this datum is a deletion
    val: Vec<u8>,
    gc_time: u64, // nonzero means scheduled for collection
}

/// The receiver half of kvpsync: applies updates, answers acks, and serves
/// lookups with an explicit "unsure" state outside the freshness window.
pub struct Receiver {
    map: HashMap<Vec<u8>, Vec<Datum>>,
    gc: VecDeque<(u64, Vec<u8>, u32)>, // (gc_time, key, update_id)
    recv_id: u32,
    sync_id: u32, // the sync we have fully flushed, or zero
    initial_sync_acked: bool,
    ok_expiry: u64,
}

/// Answer of `get_value`: a positive hit, a confident miss, or "this replica
/// cannot promise anything right now".
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a [u8]),
    NotFound,
    Unsure,
}

impl Receiver {
    pub fn new() -> Result<Self> {
        Ok(Receiver::with_recv_id(random_nonzero_u32()?))
    }

    pub(crate) fn with_recv_id(recv_id: u32) -> Self {
        Receiver {
            map: HashMap::new(),
            gc: VecDeque::new(),
            recv_id,
            sync_id: 0,
            initial_sync_acked: false,
            ok_expiry: 0,
        }
    }

    pub fn recv_id(&self) -> u32 {
        self.recv_id
    }

    /// Process one update and produce the ack to send back. Packets arriving
    /// before our resync request is honored are answered with a resync
    /// request instead of a regular ack.
    pub fn handle_update(&mut self, now: u64, update: &Update) -> Ack {
        if !self.initial_sync_acked {
            match update.body {
                UpdateBody::Start { resync_id } if resync_id == self.recv_id => {
                    self.initial_sync_acked = true;
                    return Ack {
                        sync_id: update.sync_id,
                        update_id: update.update_id,
                    };
                }
                _ => {
                    return Ack {
                        sync_id: self.recv_id,
                        update_id: 0,
                    };
                }
            }
        }

        self.do_gc(now);

        /* the sender never grants a valid ok_expiry until a sync completes,
           so ok_expiry from other sync_ids is safely ignored */
        if update.sync_id == self.sync_id {
            self.ok_expiry = self.ok_expiry.max(update.ok_expiry);
        }

        match &update.body {
            UpdateBody::Empty => {}
            UpdateBody::Start { .. } => {
                // later resyncs happen passively from our side
            }
            UpdateBody::Flush => {
                self.sync_id = update.sync_id;
                self.ok_expiry = self.ok_expiry.max(update.ok_expiry);
                self.flush_stale_data();
            }
            UpdateBody::Insert { key, val } => {
                self.apply_datum(now, update.sync_id, update.update_id, key, 0, val);
            }
            UpdateBody::Delete { key, delete_id } => {
                self.apply_datum(now, update.sync_id, update.update_id, key, *delete_id, &[]);
            }
        }

        Ack {
            sync_id: update.sync_id,
            update_id: update.update_id,
        }
    }

    /// Look up a key. Positive answers are served confidently even outside
    /// the OK window; negative answers degrade to `Unsure` past `ok_expiry`.
    pub fn get_value(&mut self, now: u64, key: &[u8]) -> Lookup<'_> {
        self.do_gc(now);

        // before the first flush we can serve nothing at all
        if self.sync_id == 0 {
            return Lookup::Unsure;
        }

        let negative = if now < self.ok_expiry {
            Lookup::NotFound
        } else {
            Lookup::Unsure
        };

        let Some(datums) = self.map.get(key) else {
            return negative;
        };

        // the datum with the highest update_id for the current sync wins
        let mut best: Option<&Datum> = None;
        for datum in datums {
            if datum.sync_id != self.sync_id {
                continue;
            }
            if best.is_some_and(|b| datum.update_id < b.update_id) {
                continue;
            }
            best = Some(datum);
        }

        match best {
            Some(datum) if datum.delete_id == 0 => Lookup::Found(&datum.val),
            _ => negative,
        }
    }

    fn apply_datum(
        &mut self,
        now: u64,
        sync_id: u32,
        update_id: u32,
        key: &[u8],
        delete_id: u32,
        val: &[u8],
    ) {
        let datums = self.map.entry(key.to_vec()).or_default();

        let mut gc_time = 0;
        let mut i = 0;
        while i < datums.len() {
            let other = &mut datums[i];
            if other.sync_id != sync_id {
                i += 1;
                continue;
            }
            if other.update_id == update_id {
                // duplicate packet
                return;
            }
            if delete_id != 0 && other.update_id == delete_id {
                // we are a deletion matching the existing insertion: drop it
                // now, and remember the pairing on a timer
                gc_time = now + GC_DELAY;
                datums.remove(i);
                continue;
            }
            if delete_id == 0 && other.delete_id == update_id {
                // we are an insertion matching an existing deletion
                if other.gc_time == 0 {
                    other.gc_time = now + GC_DELAY;
                    self.gc.push_back((other.gc_time, key.to_vec(), other.update_id));
                }
                return;
            }
            i += 1;
        }

        datums.push(Datum {
            sync_id,
            update_id,
            delete_id,
            val: val.to_vec(),
            gc_time,
        });
        if gc_time != 0 {
            self.gc.push_back((gc_time, key.to_vec(), update_id));
        }
    }

    fn do_gc(&mut self, now: u64) {
        while let Some((gc_time, _, _)) = self.gc.front() {
            if now < *gc_time {
                return;
            }
            let (gc_time, key, update_id) = self.gc.pop_front().unwrap();
            if let Some(datums) = self.map.get_mut(&key) {
                datums.retain(|d| !(d.update_id == update_id && d.gc_time == gc_time));
                if datums.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    fn flush_stale_data(&mut self) {
        let sync_id = self.sync_id;
        self.map.retain(|_, datums| {
            datums.retain(|d| d.sync_id == sync_id);
            !datums.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = crate::SECOND;

    fn update(sync_id: u32, update_id: u32, body: UpdateBody) -> Update {
        Update {
            ok_expiry: 0,
            sync_id,
            update_id,
            body,
        }
    }

    fn insert(sync_id: u32, update_id: u32, key: &[u8], val: &[u8]) -> Update {
        update(
            sync_id,
            update_id,
            UpdateBody::Insert {
                key: key.to_vec(),
                val: val.to_vec(),
            },
        )
    }

    fn delete(sync_id: u32, update_id: u32, key: &[u8], delete_id: u32) -> Update {
        update(
            sync_id,
            update_id,
            UpdateBody::Delete {
                key: key.to_vec(),
                delete_id,
            },
        )
    }

    /// Run the initial Start handshake for a sync.
    fn synced_recv(sync_id: u32) -> Receiver {
        let mut r = Receiver::with_recv_id(77);

        // anything before the matching Start earns a resync request
        let ack = r.handle_update(0, &insert(sync_id, 5, b"x", b"y"));
        assert_eq!(
            ack,
            Ack {
                sync_id: 77,
                update_id: 0
            }
        );

        let start = update(sync_id, 1, UpdateBody::Start { resync_id: 77 });
        let ack = r.handle_update(0, &start);
        assert_eq!(
            ack,
            Ack {
                sync_id,
                update_id: 1
            }
        );
        r
    }

    #[test]
    fn unsure_before_first_flush() {
        let mut r = synced_recv(10);
        r.handle_update(0, &insert(10, 2, b"A", b"aaa"));
        assert_eq!(r.get_value(0, b"A"), Lookup::Unsure);
    }

    #[test]
    fn flush_commits_and_ok_window_applies() {
        let mut r = synced_recv(10);
        r.handle_update(0, &insert(10, 2, b"A", b"aaa"));
        r.handle_update(0, &insert(10, 3, b"B", b"bbb"));
        let mut flush = update(10, 4, UpdateBody::Flush);
        flush.ok_expiry = 15 * S;
        r.handle_update(0, &flush);

        assert_eq!(r.get_value(S, b"A"), Lookup::Found(&b"aaa"[..]));
        assert_eq!(r.get_value(S, b"B"), Lookup::Found(&b"bbb"[..]));
        // confident miss inside the window, unsure after
        assert_eq!(r.get_value(S, b"C"), Lookup::NotFound);
        assert_eq!(r.get_value(16 * S, b"C"), Lookup::Unsure);
        // positive answers are served even outside the window
        assert_eq!(r.get_value(16 * S, b"A"), Lookup::Found(&b"aaa"[..]));
    }

    #[test]
    fn flush_discards_other_syncs() {
        let mut r = synced_recv(10);
        r.handle_update(0, &insert(10, 2, b"A", b"aaa"));
        r.handle_update(0, &insert(9, 2, b"B", b"stale"));
        let mut flush = update(10, 3, UpdateBody::Flush);
        flush.ok_expiry = 15 * S;
        r.handle_update(0, &flush);

        assert_eq!(r.get_value(S, b"A"), Lookup::Found(&b"aaa"[..]));
        assert_eq!(r.get_value(S, b"B"), Lookup::NotFound);
    }

    #[test]
    fn delete_annihilates_and_duplicates_cannot_resurrect() {
        let mut r = synced_recv(10);
        r.handle_update(0, &insert(10, 2, b"A", b"aaa"));
        let mut flush = update(10, 3, UpdateBody::Flush);
        flush.ok_expiry = 1000 * S;
        r.handle_update(0, &flush);
        assert_eq!(r.get_value(S, b"A"), Lookup::Found(&b"aaa"[..]));

        // the delete names the insert it cancels
        r.handle_update(S, &delete(10, 4, b"A", 2));
        assert_eq!(r.get_value(2 * S, b"A"), Lookup::NotFound);

        // a late duplicate of the insert must stay annihilated
        r.handle_update(3 * S, &insert(10, 2, b"A", b"aaa"));
        assert_eq!(r.get_value(4 * S, b"A"), Lookup::NotFound);

        // and the pairing holds until GC_DELAY has fully elapsed
        assert_eq!(r.get_value(S + GC_DELAY - 1, b"A"), Lookup::NotFound);
    }

    #[test]
    fn out_of_order_delete_then_insert() {
        let mut r = synced_recv(10);
        let mut flush = update(10, 2, UpdateBody::Flush);
        flush.ok_expiry = 1000 * S;
        r.handle_update(0, &flush);

        // the delete arrives before the insert it cancels
        r.handle_update(0, &delete(10, 4, b"A", 3));
        r.handle_update(S, &insert(10, 3, b"A", b"aaa"));
        assert_eq!(r.get_value(2 * S, b"A"), Lookup::NotFound);
    }

    #[test]
    fn higher_update_id_wins() {
        let mut r = synced_recv(10);
        let mut flush = update(10, 2, UpdateBody::Flush);
        flush.ok_expiry = 1000 * S;
        r.handle_update(0, &flush);

        r.handle_update(0, &insert(10, 4, b"A", b"new"));
        r.handle_update(0, &insert(10, 3, b"A", b"old"));
        assert_eq!(r.get_value(S, b"A"), Lookup::Found(&b"new"[..]));
    }

    #[test]
    fn ok_expiry_only_from_current_sync() {
        let mut r = synced_recv(10);
        let mut flush = update(10, 2, UpdateBody::Flush);
        flush.ok_expiry = 10 * S;
        r.handle_update(0, &flush);

        // an ok_expiry extension tagged with a foreign sync is ignored
        let mut foreign = update(11, 9, UpdateBody::Empty);
        foreign.ok_expiry = 1000 * S;
        r.handle_update(0, &foreign);
        assert_eq!(r.get_value(11 * S, b"nope"), Lookup::Unsure);

        let mut own = update(10, 5, UpdateBody::Empty);
        own.ok_expiry = 1000 * S;
        r.handle_update(0, &own);
        assert_eq!(r.get_value(11 * S, b"nope"), Lookup::NotFound);
    }
}
