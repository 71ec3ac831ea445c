/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! Engine pipeline behavior without a TLS stage: the socket engine wired
//! straight to the IMAP engine, exercising FIFO ordering, pool-driven
//! backpressure, and clean teardown.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sm_engine::{
    EngineQueue, EngineSender, ImapEngine, LogicOut, Session, SessionLogic, SocketEngine,
};

struct Echo {
    session: Arc<Session>,
}

impl SessionLogic for Echo {
    fn on_start(&mut self, _out: &mut LogicOut) {}

    fn on_read(&mut self, data: &[u8], out: &mut LogicOut) -> sm_types::Result<()> {
        out.write(&self.session, data);
        Ok(())
    }

    fn on_eof(&mut self, out: &mut LogicOut) {
        out.close(&self.session, None);
    }
}

/// socket -> imap -> socket, with deliberately tiny event pools so the
/// transfer has to recycle buffers constantly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_under_backpressure() {
    let sock_q = EngineQueue::new("sock");
    let imap_q = EngineQueue::new("imap");
    let sock_tx = sock_q.sender();
    let imap_tx = imap_q.sender();

    let sock = SocketEngine::new(sock_q, imap_tx, 2);
    let imap = ImapEngine::new(imap_q, sock_tx, 2);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // a deterministic but non-repeating payload, much larger than the pools
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();

    let expected_len = expected.len();
    let client = thread::spawn(move || {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mut reader = stream.try_clone().unwrap();
        let mut writer_stream = stream;
        let writer_payload = payload;
        let writer = thread::spawn(move || {
            writer_stream.write_all(&writer_payload).unwrap();
        });
        let mut got = vec![0u8; expected_len];
        reader.read_exact(&mut got).unwrap();
        writer.join().unwrap();
        got
    });

    let (stream, _) = listener.accept().await.unwrap();
    let (err_tx, err_rx) = flume::bounded(1);
    let (session, owner) = Session::new(
        false,
        [sock.sender(), EngineSender::null("tls"), imap.sender()],
        move |err| {
            let _ = err_tx.send(err);
        },
    );
    imap.start_session(
        &session,
        Box::new(Echo {
            session: session.clone(),
        }),
    );
    sock.start_session(owner, stream);

    let got = tokio::task::spawn_blocking(move || client.join().unwrap())
        .await
        .unwrap();
    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected, "echoed bytes must arrive intact and in order");

    // EOF closed the session; the destroy callback reports no error
    let err = tokio::time::timeout(Duration::from_secs(10), err_rx.recv_async())
        .await
        .expect("session should be destroyed")
        .unwrap();
    assert!(err.is_none(), "unexpected session error: {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_tears_down_both_directions() {
    let sock_q = EngineQueue::new("sock");
    let imap_q = EngineQueue::new("imap");
    let sock_tx = sock_q.sender();
    let imap_tx = imap_q.sender();

    let sock = SocketEngine::new(sock_q, imap_tx, 4);
    let imap = ImapEngine::new(imap_q, sock_tx, 4);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        // the server closing the session must surface as EOF here
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    let (stream, _) = listener.accept().await.unwrap();
    let (err_tx, err_rx) = flume::bounded(1);
    let (session, owner) = Session::new(
        false,
        [sock.sender(), EngineSender::null("tls"), imap.sender()],
        move |err| {
            let _ = err_tx.send(err);
        },
    );
    imap.start_session(
        &session,
        Box::new(Echo {
            session: session.clone(),
        }),
    );
    sock.start_session(owner, stream);

    session.close(None);
    let err = tokio::time::timeout(Duration::from_secs(10), err_rx.recv_async())
        .await
        .expect("session should be destroyed")
        .unwrap();
    assert!(err.is_none());

    tokio::task::spawn_blocking(move || client.join().unwrap())
        .await
        .unwrap();
}
