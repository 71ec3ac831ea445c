/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! End-to-end sender/receiver conversations, driven deterministically by
//! shuttling packets between the two state machines.

use sm_kvpsync::{Lookup, Receiver, Sender, MIN_RESPONSE, SECOND};

/// Pump the sender until it goes quiet, delivering every packet to the
/// receiver and every ack straight back.
fn pump(s: &mut Sender, r: &mut Receiver, now: u64) {
    loop {
        let (pkt, deadline) = s.run(now);
        match pkt {
            Some(update) => {
                let ack = r.handle_update(now, &update);
                s.handle_ack(ack, now);
                if deadline == 0 {
                    continue;
                }
            }
            None => return,
        }
    }
}

#[test]
fn initial_sync_and_lookup() {
    let mut now = 1;
    let mut s = Sender::new(now).unwrap();
    let mut r = Receiver::new().unwrap();

    s.add_key(now, b"A", b"aaa", None).unwrap();
    s.add_key(now, b"B", b"bbb", None).unwrap();

    // the first packets provoke a resync request, then the whole
    // start/insert/flush conversation converges
    pump(&mut s, &mut r, now);
    assert!(s.recv_ok());

    now += SECOND;
    assert_eq!(r.get_value(now, b"A"), Lookup::Found(&b"aaa"[..]));
    assert_eq!(r.get_value(now, b"B"), Lookup::Found(&b"bbb"[..]));
    // a miss is confident inside the ok window, unsure beyond it
    assert_eq!(r.get_value(now, b"C"), Lookup::NotFound);
    assert_eq!(r.get_value(now + MIN_RESPONSE, b"C"), Lookup::Unsure);
}

#[test]
fn delete_propagates_and_sticks() {
    let mut now = 1;
    let mut s = Sender::new(now).unwrap();
    let mut r = Receiver::new().unwrap();

    s.add_key(now, b"A", b"aaa", None).unwrap();
    pump(&mut s, &mut r, now);

    now += SECOND;
    s.delete_key(b"A");
    pump(&mut s, &mut r, now);

    assert_eq!(r.get_value(now, b"A"), Lookup::NotFound);
    // once the ok window lapses without keepalives, the miss degrades
    assert_eq!(r.get_value(now + MIN_RESPONSE, b"A"), Lookup::Unsure);
}

#[test]
fn receiver_restart_triggers_resync() {
    let mut now = 1;
    let mut s = Sender::new(now).unwrap();
    let mut r = Receiver::new().unwrap();

    s.add_key(now, b"A", b"aaa", None).unwrap();
    pump(&mut s, &mut r, now);
    let first_sync = s.sync_id();

    // the receiver restarts and knows nothing
    let mut r = Receiver::new().unwrap();
    now += SECOND;
    assert_eq!(r.get_value(now, b"A"), Lookup::Unsure);

    // the sender is idle until its keepalive deadline; the keepalive then
    // provokes the resync request and the cache is replayed under a fresh
    // sync_id
    let (pkt, deadline) = s.run(now);
    assert!(pkt.is_none());
    now = deadline;
    pump(&mut s, &mut r, now);
    assert_ne!(s.sync_id(), first_sync);
    assert_eq!(r.get_value(now, b"A"), Lookup::Found(&b"aaa"[..]));
}

#[test]
fn add_key_callback_fires_once_across_resync() {
    let mut now = 1;
    let mut s = Sender::new(now).unwrap();
    let mut r = Receiver::new().unwrap();

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();

    s.add_key(
        now,
        b"A",
        b"aaa",
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    pump(&mut s, &mut r, now);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // a receiver restart replays the insert, but the callback stays quiet
    let mut r = Receiver::new().unwrap();
    now += SECOND;
    let (pkt, deadline) = s.run(now);
    assert!(pkt.is_none());
    now = deadline;
    pump(&mut s, &mut r, now);
    assert_eq!(r.get_value(now, b"A"), Lookup::Found(&b"aaa"[..]));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn udp_loopback_sync() {
    use sm_kvpsync::{now_ms, ReceiverIo, SenderIo};
    use std::time::Duration;

    let recv_io = ReceiverIo::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let peer = recv_io.local_addr().unwrap();
    let send_io = SenderIo::bind("127.0.0.1:0".parse().unwrap(), peer)
        .await
        .unwrap();

    tokio::spawn(async move {
        let mut receiver = Receiver::new().unwrap();
        let _ = recv_io.run(&mut receiver).await;
    });

    let mut sender = Sender::new(now_ms()).unwrap();
    sender.add_key(now_ms(), b"A", b"aaa", None).unwrap();
    tokio::time::timeout(Duration::from_secs(30), send_io.run_until_ok(&mut sender))
        .await
        .expect("sync should converge quickly")
        .unwrap();
    assert!(sender.recv_ok());
}

#[test]
fn modification_wins_over_stale_duplicates() {
    let mut now = 1;
    let mut s = Sender::new(now).unwrap();
    let mut r = Receiver::new().unwrap();

    s.add_key(now, b"A", b"old", None).unwrap();
    pump(&mut s, &mut r, now);

    now += SECOND;
    s.add_key(now, b"A", b"new", None).unwrap();
    pump(&mut s, &mut r, now);

    assert_eq!(r.get_value(now, b"A"), Lookup::Found(&b"new"[..]));
}
