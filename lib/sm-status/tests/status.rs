/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use sm_status::{StatusClient, StatusServer};
use sm_types::{CitmStatus, ErrorKind, StatusMaj, StatusMin};

const VERSION: (u32, u32, u32) = (0, 3, 0);

fn sock_path() -> PathBuf {
    std::env::temp_dir().join(format!("sm-status-test-{:08x}.sock", fastrand::u32(..)))
}

async fn read_line(stream: &mut UnixStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        if n == 0 {
            panic!("eof before newline; got {:?}", String::from_utf8_lossy(&line));
        }
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
        line.push(byte[0]);
    }
}

struct TestServer {
    server: StatusServer,
    path: PathBuf,
    checks: Arc<AtomicUsize>,
    done_rx: flume::Receiver<ErrorKind>,
}

fn spawn_server(maj: StatusMaj, min: StatusMin, fulldomain: &str) -> TestServer {
    let path = sock_path();
    let checks = Arc::new(AtomicUsize::new(0));
    let checks2 = checks.clone();
    let (done_tx, done_rx) = flume::unbounded();
    let server = StatusServer::bind(
        &path,
        CitmStatus::new(VERSION, maj, min, fulldomain),
        move || {
            checks2.fetch_add(1, Ordering::SeqCst);
        },
        move |err| {
            let _ = done_tx.send(err.kind());
        },
    )
    .unwrap();
    TestServer {
        server,
        path,
        checks,
        done_rx,
    }
}

#[tokio::test]
async fn initial_status_and_rejections() {
    let ts = spawn_server(StatusMaj::NeedConf, StatusMin::None, "");

    let mut conn = UnixStream::connect(&ts.path).await.unwrap();
    assert_eq!(
        read_line(&mut conn).await,
        "{\"version_maj\":0,\"version_min\":3,\"version_patch\":0,\
         \"major\":\"need conf\",\"minor\":\"\",\"fulldomain\":\"\",\
         \"configured\":\"no\",\"tls_ready\":\"no\"}"
    );

    // non-json input earns an error, and the connection persists
    conn.write_all(b"abvosiejfeoi\n").await.unwrap();
    assert_eq!(
        read_line(&mut conn).await,
        "{\"status\":\"error\",\"reason\":\"invalid json\"}"
    );

    // valid json that is not a command object
    conn.write_all(b"true\n").await.unwrap();
    assert_eq!(
        read_line(&mut conn).await,
        "{\"status\":\"error\",\"reason\":\"invalid command\"}"
    );

    // an unrecognized command, split across two writes
    conn.write_all(b"{\"command\":").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.write_all(b"\"halt-and-catch-fire\"}\n").await.unwrap();
    assert_eq!(
        read_line(&mut conn).await,
        "{\"status\":\"error\",\"reason\":\"unrecognized command\"}"
    );

    // multiple complete commands in one buffer
    conn.write_all(b"{\"command\":\"check\"}\n{\"command\":\"unrecog\"}\n")
        .await
        .unwrap();
    assert_eq!(
        read_line(&mut conn).await,
        "{\"status\":\"error\",\"reason\":\"unrecognized command\"}"
    );
    assert_eq!(ts.checks.load(Ordering::SeqCst), 1);

    ts.server.close();
    assert_eq!(
        ts.done_rx.recv_async().await.unwrap(),
        ErrorKind::Canceled
    );
}

#[tokio::test]
async fn oversize_line_is_rejected_and_closed() {
    let ts = spawn_server(StatusMaj::NeedConf, StatusMin::None, "");

    let mut conn = UnixStream::connect(&ts.path).await.unwrap();
    let _ = read_line(&mut conn).await;

    let long = vec![b'x'; 4096];
    conn.write_all(&long).await.unwrap();
    assert_eq!(read_line(&mut conn).await, "{\"fail\":\"command too long\"}");

    // then the server hangs up
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
        .await
        .expect("timed out waiting for eof")
        .unwrap();
    assert_eq!(n, 0);

    ts.server.close();
}

#[tokio::test]
async fn updates_reach_all_clients() {
    let ts = spawn_server(StatusMaj::NeedConf, StatusMin::None, "");

    let mut a = UnixStream::connect(&ts.path).await.unwrap();
    let mut b = UnixStream::connect(&ts.path).await.unwrap();
    let _ = read_line(&mut a).await;
    let _ = read_line(&mut b).await;

    ts.server
        .update(StatusMaj::TlsFirst, StatusMin::CreateAccount, "yo.com");
    let expected = "{\"major\":\"tls first\",\"minor\":\"create account\",\
         \"fulldomain\":\"yo.com\",\"configured\":\"yes\",\"tls_ready\":\"no\"}";
    assert_eq!(read_line(&mut a).await, expected);
    assert_eq!(read_line(&mut b).await, expected);

    // late joiners see the updated status in their initial packet
    let mut c = UnixStream::connect(&ts.path).await.unwrap();
    let line = read_line(&mut c).await;
    assert!(line.contains("\"major\":\"tls first\""), "got {line}");
    assert!(line.contains("\"version_maj\":0"), "got {line}");

    ts.server.close();
}

#[tokio::test]
async fn client_end_to_end() {
    let ts = spawn_server(StatusMaj::TlsRenew, StatusMin::CreateOrder, "yo.com");

    let (update_tx, update_rx) = flume::unbounded();
    let (done_tx, done_rx) = flume::unbounded();
    let client = StatusClient::connect(
        &ts.path,
        move |status| {
            let _ = update_tx.send(status);
        },
        move |err| {
            let _ = done_tx.send(err.kind());
        },
    )
    .await
    .unwrap();

    let status = update_rx.recv_async().await.unwrap();
    assert_eq!(status.major, "tls renew");
    assert_eq!(status.minor, "create order");
    assert_eq!(status.fulldomain, "yo.com");
    assert_eq!(status.version_maj, VERSION.0);

    // a check round-trip reaches the server's callback
    client.check();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ts.checks.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("check should reach the server");

    // a pushed update folds into the full status
    ts.server
        .update(StatusMaj::TlsRenew, StatusMin::GetAuthz, "yo.com");
    let status = update_rx.recv_async().await.unwrap();
    assert_eq!(status.minor, "get authz");
    assert_eq!(status.version_maj, VERSION.0);

    client.close();
    assert_eq!(done_rx.recv_async().await.unwrap(), ErrorKind::Canceled);

    ts.server.close();
    assert_eq!(ts.done_rx.recv_async().await.unwrap(), ErrorKind::Canceled);
}
