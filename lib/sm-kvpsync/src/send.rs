/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::collections::VecDeque;

use foldhash::{HashMap, HashMapExt};

use sm_crypto::random_nonzero_u32;
use sm_types::{Error, ErrorKind, Result};

use crate::pkts::{Ack, Update, UpdateBody, KVPSYNC_MAX_LEN};
use crate::{MIN_RESPONSE, SECOND};

const MIN_INFLIGHT: i32 = 1;
const INCREASE_PKTS: i32 = 1;
const DECREASE_BACKOFF: u64 = SECOND;
const FAULT_AFTER: u64 = SECOND;
const KEEPALIVE_LEAD: u64 = 3 * SECOND;

type AckCallback = Box<dyn FnOnce() + Send>;

struct CacheEntry {
    val: Vec<u8>,
    cb: Option<AckCallback>,
    /* bumped on every add_key for the same key, so acks for an overwritten
       insert can be told apart from acks for the live one */
    generation: u64,
    deadline: u64,
    awaiting_ack: bool,
    // ids of the insert as last queued, for delete cancellation
    sent_sync_id: u32,
    sent_update_id: u32,
}

struct Packet {
    update: Update,
    inflight: bool,
    inflight_at_send: i32,
    congest_validity: u32,
    sent_time: u64,
    // identifies the cache entry an insert belongs to
    key_gen: Option<(Vec<u8>, u64)>,
}

/// The sender half of kvpsync.
///
/// Packet lifetime: a freshly queued packet sits in `unsent`; once written to
/// the wire it moves to `sent` (oldest first); a resend decision moves it
/// back to `unsent`. Only packets in `sent` count as inflight. Every queued
/// packet is tracked in `unacked` until its ack arrives.
pub struct Sender {
    sync_id: u32,
    resync_id: u32,
    update_id: u32,
    generation: u64,

    /* Our own cache of everything we are serving, so resyncs can replay the
       full content without help from the caller. */
    cache: HashMap<Vec<u8>, CacheEntry>,

    unsent: VecDeque<u32>,
    sent: VecDeque<u32>,
    unacked: HashMap<u32, Packet>,

    /* keys with an insert awaiting its first ack, in add order; ok_expiry
       must never pass the deadline of the front entry */
    oldest: VecDeque<(Vec<u8>, u64, u64)>,

    // congestion control
    inflight: i32,
    inflight_limit: i32,
    decrease_backoff: u64,
    congest_validity: u32,
    last_recv: u64,

    recv_ok: bool,
    old_recv_ok: bool,
    ok_expiry: u64,
    last_extend_ok: u64,

    synced: bool,
    start_done: bool,
    start_sent: bool,
    sync_done: bool,
    sync_sent: bool,

    state_cb: Option<Box<dyn FnMut(bool) + Send>>,
}

impl Sender {
    pub fn new(now: u64) -> Result<Self> {
        Ok(Sender::with_sync_id(random_nonzero_u32()?, now))
    }

    pub(crate) fn with_sync_id(sync_id: u32, now: u64) -> Self {
        Sender {
            sync_id,
            resync_id: 0,
            update_id: 0,
            generation: 0,
            cache: HashMap::new(),
            unsent: VecDeque::new(),
            sent: VecDeque::new(),
            unacked: HashMap::new(),
            oldest: VecDeque::new(),
            inflight: 0,
            inflight_limit: MIN_INFLIGHT,
            decrease_backoff: 0,
            congest_validity: 0,
            last_recv: 0,
            recv_ok: false,
            old_recv_ok: false,
            // start in not-ok state, but assume the receiver just got an
            // ok extension
            ok_expiry: now + MIN_RESPONSE,
            last_extend_ok: 0,
            synced: false,
            start_done: false,
            start_sent: false,
            sync_done: false,
            sync_sent: false,
            state_cb: None,
        }
    }

    /// Register a callback for receiver OK-state transitions.
    pub fn set_state_cb(&mut self, cb: impl FnMut(bool) + Send + 'static) {
        self.state_cb = Some(Box::new(cb));
    }

    pub fn sync_id(&self) -> u32 {
        self.sync_id
    }

    pub fn recv_ok(&self) -> bool {
        self.recv_ok
    }

    #[cfg(test)]
    pub(crate) fn set_inflight_limit(&mut self, limit: i32) {
        self.inflight_limit = limit;
    }

    #[cfg(test)]
    pub(crate) fn inflight_limit(&self) -> i32 {
        self.inflight_limit
    }

    #[cfg(test)]
    pub(crate) fn inflight(&self) -> i32 {
        self.inflight
    }

    /// Add or replace a key-value pair. `cb` fires exactly once, when the
    /// corresponding insert is first acked under the sync it was sent with;
    /// a later `add_key` or `delete_key` for the same key before that drops
    /// the callback unfired.
    pub fn add_key(
        &mut self,
        now: u64,
        key: &[u8],
        val: &[u8],
        cb: Option<AckCallback>,
    ) -> Result<()> {
        if key.len() > KVPSYNC_MAX_LEN {
            return Err(Error::new(ErrorKind::Param, "key too long"));
        }
        if val.len() > KVPSYNC_MAX_LEN {
            return Err(Error::new(ErrorKind::Param, "value too long"));
        }

        self.generation += 1;
        let entry = CacheEntry {
            val: val.to_vec(),
            cb,
            generation: self.generation,
            deadline: now + MIN_RESPONSE,
            awaiting_ack: true,
            sent_sync_id: 0,
            sent_update_id: 0,
        };

        if let Some(old) = self.cache.insert(key.to_vec(), entry) {
            self.queue_delete_for(key, &old);
        }
        self.oldest
            .push_back((key.to_vec(), self.generation, now + MIN_RESPONSE));

        if self.sync_sent {
            self.queue_insert(key);
        }
        Ok(())
    }

    /// Remove a key-value pair; any unfired `add_key` callback for it is
    /// guaranteed not to run.
    pub fn delete_key(&mut self, key: &[u8]) {
        if let Some(old) = self.cache.remove(key) {
            self.queue_delete_for(key, &old);
        }
    }

    /// Process an incoming ack.
    pub fn handle_ack(&mut self, ack: Ack, now: u64) {
        self.last_recv = now;

        if ack.is_resync_request() {
            let resync_id = ack.sync_id;
            // duplicates are covered by the normal resend logic
            if resync_id != self.resync_id {
                self.resync(resync_id);
            }
            return;
        }

        // stale acks from an earlier synchronization
        if ack.sync_id != self.sync_id {
            return;
        }

        let Some(pkt) = self.unacked.remove(&ack.update_id) else {
            return;
        };
        self.remove_from_queues(ack.update_id, pkt.inflight);

        self.successful_packet(&pkt);

        if let Some((key, generation)) = &pkt.key_gen {
            if let Some(entry) = self.cache.get_mut(key) {
                if entry.generation == *generation && entry.awaiting_ack {
                    entry.awaiting_ack = false;
                    if let Some(cb) = entry.cb.take() {
                        cb();
                    }
                }
            }
        }
    }

    /// Advance the state machine: possibly produce one packet to put on the
    /// wire, and report when `run` should next be called. A deadline of zero
    /// means "again immediately".
    pub fn run(&mut self, now: u64) -> (Option<Update>, u64) {
        self.advance_state(now);

        if self.recv_ok && now >= self.ok_expiry {
            // the peer can no longer trust its data
            self.recv_ok = false;
        }

        // an unresponsive peer: collapse the window and resend everything
        if let Some(&first) = self.sent.front() {
            let pkt = &self.unacked[&first];
            if now >= fault_time(pkt) && self.last_recv <= pkt.sent_time {
                while let Some(id) = self.sent.pop_back() {
                    let pkt = self.unacked.get_mut(&id).unwrap();
                    pkt.inflight = false;
                    self.unsent.push_front(id);
                }
                self.inflight = 0;
                self.inflight_limit = MIN_INFLIGHT;
            }
        }

        // individual packets past their fault time: the peer is responding
        // but these got skipped, so resend them
        while let Some(&first) = self.sent.front() {
            let pkt = &self.unacked[&first];
            if now < fault_time(pkt) {
                break;
            }
            self.sent.pop_front();
            let pkt = self.unacked.get_mut(&first).unwrap();
            if pkt.inflight {
                pkt.inflight = false;
                self.inflight -= 1;
            }
            self.unsent.push_back(first);
            self.fault_detected(first, now);
        }

        let mut out = None;
        let deadline;

        if self.inflight < self.inflight_limit && !self.unsent.is_empty() {
            out = Some(self.send_front(now));
            if self.inflight < self.inflight_limit && !self.unsent.is_empty() {
                // another packet can go out immediately
                deadline = 0;
            } else {
                deadline = self.front_fault_time().unwrap();
            }
        } else if let Some(t) = self.front_fault_time() {
            deadline = t;
        } else if now + KEEPALIVE_LEAD < self.ok_expiry {
            deadline = self.ok_expiry - KEEPALIVE_LEAD;
        } else {
            // nothing in flight and the window is closing: keepalive
            self.recv_ok = true;
            self.queue(UpdateBody::Empty, None);
            out = Some(self.send_front(now));
            deadline = self.front_fault_time().unwrap();
        }

        let deadline = if self.recv_ok && deadline > self.ok_expiry {
            self.ok_expiry
        } else {
            deadline
        };

        self.notify_state();
        (out, deadline)
    }

    fn advance_state(&mut self, now: u64) {
        if self.synced {
            return;
        }
        if !self.start_done {
            if !self.start_sent {
                self.queue(
                    UpdateBody::Start {
                        resync_id: self.resync_id,
                    },
                    None,
                );
                self.start_sent = true;
            }
            if !self.unacked.is_empty() {
                return;
            }
            self.start_done = true;
        }
        if !self.sync_done {
            if !self.sync_sent {
                let keys: Vec<Vec<u8>> = self.cache.keys().cloned().collect();
                for key in keys {
                    self.queue_insert(&key);
                }
                self.sync_sent = true;
            }
            if !self.unacked.is_empty() {
                return;
            }
            self.sync_done = true;
        }
        // the receiver enters the OK state with the flush
        self.recv_ok = true;
        let _ = self.calculate_ok_expiry(now);
        self.queue(UpdateBody::Flush, None);
        self.synced = true;
    }

    fn queue(&mut self, body: UpdateBody, key_gen: Option<(Vec<u8>, u64)>) -> u32 {
        self.update_id += 1;
        let update_id = self.update_id;
        let update = Update {
            ok_expiry: 0,
            sync_id: self.sync_id,
            update_id,
            body,
        };
        self.unsent.push_back(update_id);
        self.unacked.insert(
            update_id,
            Packet {
                update,
                inflight: false,
                inflight_at_send: 0,
                congest_validity: 0,
                sent_time: 0,
                key_gen,
            },
        );
        update_id
    }

    fn queue_insert(&mut self, key: &[u8]) {
        let Some(entry) = self.cache.get(key) else {
            return;
        };
        let body = UpdateBody::Insert {
            key: key.to_vec(),
            val: entry.val.clone(),
        };
        let key_gen = Some((key.to_vec(), entry.generation));
        let update_id = self.queue(body, key_gen);
        let sync_id = self.sync_id;
        let entry = self.cache.get_mut(key).unwrap();
        entry.sent_sync_id = sync_id;
        entry.sent_update_id = update_id;
    }

    fn queue_delete_for(&mut self, key: &[u8], old: &CacheEntry) {
        // only worth sending if the old insert went out under this sync
        if self.sync_sent && old.sent_sync_id == self.sync_id {
            self.queue(
                UpdateBody::Delete {
                    key: key.to_vec(),
                    delete_id: old.sent_update_id,
                },
                None,
            );
        }
    }

    fn remove_from_queues(&mut self, update_id: u32, was_inflight: bool) {
        if was_inflight {
            self.inflight -= 1;
        }
        self.sent.retain(|&id| id != update_id);
        self.unsent.retain(|&id| id != update_id);
    }

    fn send_front(&mut self, now: u64) -> Update {
        let id = self.unsent.pop_front().unwrap();
        self.sent.push_back(id);
        self.inflight += 1;
        let ok_expiry = self.calculate_ok_expiry(now);
        let inflight = self.inflight;
        let congest_validity = self.congest_validity;
        let pkt = self.unacked.get_mut(&id).unwrap();
        pkt.sent_time = now;
        pkt.inflight = true;
        pkt.inflight_at_send = inflight;
        pkt.congest_validity = congest_validity;
        pkt.update.ok_expiry = ok_expiry;
        pkt.update.clone()
    }

    fn front_fault_time(&self) -> Option<u64> {
        self.sent.front().map(|id| fault_time(&self.unacked[id]))
    }

    fn calculate_ok_expiry(&mut self, now: u64) -> u64 {
        if !self.recv_ok {
            return 0;
        }

        let mut ok_expiry = self.ok_expiry;
        if self.last_recv > self.last_extend_ok {
            // proof of responsiveness since the last extension
            ok_expiry = now + MIN_RESPONSE;
        }
        if let Some(deadline) = self.peek_oldest_deadline() {
            /* ok_expiry must never pass the deadline of the oldest unacked
               insert, so that across replicas a new key is either served
               everywhere or known stale within MIN_RESPONSE */
            ok_expiry = ok_expiry.min(deadline);
        }

        if ok_expiry > self.ok_expiry {
            self.ok_expiry = ok_expiry;
            self.last_extend_ok = now;
        }

        ok_expiry
    }

    fn peek_oldest_deadline(&mut self) -> Option<u64> {
        while let Some((key, generation, deadline)) = self.oldest.front() {
            match self.cache.get(key) {
                Some(entry) if entry.generation == *generation && entry.awaiting_ack => {
                    return Some(*deadline);
                }
                _ => {
                    self.oldest.pop_front();
                }
            }
        }
        None
    }

    fn successful_packet(&mut self, pkt: &Packet) {
        if pkt.congest_validity != self.congest_validity {
            return;
        }
        if pkt.inflight_at_send < self.inflight_limit {
            return;
        }
        self.inflight_limit += INCREASE_PKTS;
        self.congest_validity += 1;
    }

    fn fault_detected(&mut self, update_id: u32, now: u64) {
        let pkt = &self.unacked[&update_id];
        if pkt.congest_validity != self.congest_validity {
            return;
        }
        if now < self.decrease_backoff {
            return;
        }
        self.inflight_limit = ((self.inflight_limit * 4) / 5).max(MIN_INFLIGHT);
        self.decrease_backoff = now + DECREASE_BACKOFF;
        self.congest_validity += 1;
    }

    /// Keep the cache and congestion limit; drop every queued packet and
    /// start over under a fresh sync_id.
    fn resync(&mut self, resync_id: u32) {
        self.resync_id = resync_id;
        self.sync_id = self.sync_id.wrapping_add(1);
        if self.sync_id == 0 {
            self.sync_id = 1;
        }
        self.update_id = 0;

        self.recv_ok = false;
        self.last_extend_ok = 0;

        self.unsent.clear();
        self.sent.clear();
        self.unacked.clear();
        self.inflight = 0;
        // a resync means the receiver knows it is not ok
        self.ok_expiry = 0;

        self.synced = false;
        self.start_done = false;
        self.start_sent = false;
        self.sync_done = false;
        self.sync_sent = false;
    }

    fn notify_state(&mut self) {
        if self.recv_ok != self.old_recv_ok {
            self.old_recv_ok = self.recv_ok;
            if let Some(cb) = self.state_cb.as_mut() {
                cb(self.recv_ok);
            }
        }
    }
}

fn fault_time(pkt: &Packet) -> u64 {
    pkt.sent_time + FAULT_AFTER
}
