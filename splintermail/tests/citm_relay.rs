/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The core citm scenario end to end: a mail client on an insecure
//! listener, a TLS mail server upstream, and an encrypted message in the
//! FETCH stream that must reach the client as plaintext.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509};

use sm_crypto::{Encrypter, Keypair};
use sm_engine::{EngineQueue, EngineSender, ImapEngine, Session, SocketEngine};
use sm_tls::{TlsContext, TlsEngine, TlsPrestart};
use splintermail::citm::{RelayDown, RelayShared, RelayUp, SharedIgnoreList};

const SECRET_MAIL: &[u8] = b"Subject: the plan\r\n\r\nmeet at noon\r\n";

fn tempdir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sm-relay-test-{:08x}", fastrand::u32(..)));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_ca_and_leaf() -> (X509, X509, PKey<Private>) {
    let now = || {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    };

    let ca_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "relay test ca").unwrap();
    let ca_name = name.build();
    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    b.set_serial_number(&serial).unwrap();
    b.set_subject_name(&ca_name).unwrap();
    b.set_issuer_name(&ca_name).unwrap();
    b.set_pubkey(&ca_key).unwrap();
    b.set_not_before(&Asn1Time::from_unix(now() - 3600).unwrap()).unwrap();
    b.set_not_after(&Asn1Time::from_unix(now() + 86400).unwrap()).unwrap();
    b.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    b.sign(&ca_key, MessageDigest::sha256()).unwrap();
    let ca = b.build();

    let leaf_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "127.0.0.1").unwrap();
    let leaf_name = name.build();
    let mut b = X509::builder().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(2).unwrap().to_asn1_integer().unwrap();
    b.set_serial_number(&serial).unwrap();
    b.set_subject_name(&leaf_name).unwrap();
    b.set_issuer_name(ca.subject_name()).unwrap();
    b.set_pubkey(&leaf_key).unwrap();
    b.set_not_before(&Asn1Time::from_unix(now() - 3600).unwrap()).unwrap();
    b.set_not_after(&Asn1Time::from_unix(now() + 86400).unwrap()).unwrap();
    let san = {
        let ctx = b.x509v3_context(Some(&ca), None);
        SubjectAlternativeName::new().ip("127.0.0.1").build(&ctx).unwrap()
    };
    b.append_extension(san).unwrap();
    b.sign(&ca_key, MessageDigest::sha256()).unwrap();
    (ca, b.build(), leaf_key)
}

fn envelope_for(key: &Keypair, plaintext: &[u8]) -> Vec<u8> {
    let mut ec = Encrypter::new();
    let mut out = Vec::new();
    ec.start(std::slice::from_ref(key), &mut out).unwrap();
    ec.update(plaintext, &mut out).unwrap();
    ec.finish(&mut out).unwrap();
    out
}

/// A fake TLS IMAP server: greet, then answer the first command with a
/// FETCH response wrapping the given envelope.
fn spawn_mail_server(
    cert: X509,
    key: PKey<Private>,
    envelope: Vec<u8>,
) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    acceptor.set_private_key(&key).unwrap();
    let acceptor = acceptor.build();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let join = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        tls.write_all(b"* OK IMAP4rev1 server ready\r\n").unwrap();

        // wait for one command line
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\n") {
            if tls.read(&mut byte).unwrap() == 0 {
                return;
            }
            line.push(byte[0]);
        }

        let mut response = Vec::new();
        response.extend_from_slice(b"* 1 FETCH (RFC822 {0}\r\n");
        response.extend_from_slice(&envelope);
        response.extend_from_slice(b")\r\na1 OK FETCH completed\r\n");
        tls.write_all(&response).unwrap();

        // hold the connection until the peer hangs up
        let mut buf = [0u8; 256];
        loop {
            match tls.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    (addr, join)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_mail_is_decrypted_in_flight() {
    let (ca, cert, cert_key) = make_ca_and_leaf();
    let device = Keypair::generate(2048).unwrap();
    let envelope = envelope_for(&device, SECRET_MAIL);
    let (server_addr, server) = spawn_mail_server(cert, cert_key, envelope);

    let dir = tempdir();
    let ignore = Arc::new(SharedIgnoreList::load(&dir));

    // pipeline
    let sock_q = EngineQueue::new("sock");
    let tls_q = EngineQueue::new("tls");
    let imap_q = EngineQueue::new("imap");
    let sock_tx = sock_q.sender();
    let tls_tx = tls_q.sender();
    let imap_tx = imap_q.sender();
    let sock = SocketEngine::new(sock_q, tls_tx.clone(), 8);
    let tls = TlsEngine::new(tls_q, sock_tx, imap_tx, 8, 8);
    let imap = ImapEngine::new(imap_q, tls_tx, 8);
    let senders = || -> [EngineSender; 3] { [sock.sender(), tls.sender(), imap.sender()] };

    // the local mail client, speaking plaintext to the insecure listener
    let client_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    let client = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(client_addr).unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];

        // citm's own greeting comes first
        while !got.windows(2).any(|w| w == b"\r\n") {
            let n = stream.read(&mut buf).unwrap();
            assert_ne!(n, 0);
            got.extend_from_slice(&buf[..n]);
        }
        let greeting = String::from_utf8_lossy(&got).to_string();
        assert!(greeting.contains("greetings, friend"), "got {greeting}");
        got.clear();

        stream.write_all(b"a1 FETCH 1 RFC822\r\n").unwrap();
        while !got
            .windows(b"a1 OK FETCH completed\r\n".len())
            .any(|w| w == b"a1 OK FETCH completed\r\n")
        {
            let n = stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "eof before FETCH completed");
            got.extend_from_slice(&buf[..n]);
        }
        let _ = stream.shutdown(std::net::Shutdown::Both);
        got
    });

    // wire the relay the way the citm serve path does
    let (client_stream, _) = client_listener.accept().await.unwrap();
    let upstream = tokio::net::TcpStream::connect(server_addr).await.unwrap();

    let shared = RelayShared::new();
    let (up_session, up_owner) = Session::new(true, senders(), {
        let shared = shared.clone();
        move |_| shared.shutdown()
    });
    shared.set_up(&up_session);
    let (down_session, down_owner) = Session::new(false, senders(), {
        let shared = shared.clone();
        move |_| shared.shutdown()
    });
    shared.set_down(&down_session);

    let client_ctx = TlsContext::client_with_root_pem(&ca.to_pem().unwrap()).unwrap();
    tls.start_session(
        &up_session,
        TlsPrestart {
            ctx: Some(client_ctx),
            verify_name: Some("127.0.0.1".to_string()),
        },
    );
    imap.start_session(
        &up_session,
        Box::new(RelayUp::new(shared.clone(), device.clone(), ignore)),
    );
    sock.start_session(up_owner, upstream);

    tls.start_session(
        &down_session,
        TlsPrestart {
            ctx: None,
            verify_name: None,
        },
    );
    imap.start_session(
        &down_session,
        Box::new(RelayDown::new(shared.clone(), down_session.clone(), true)),
    );
    sock.start_session(down_owner, client_stream);

    let got = tokio::task::spawn_blocking(move || client.join().unwrap())
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&got);
    assert!(
        text.contains("meet at noon"),
        "decrypted body missing: {text}"
    );
    assert!(
        !text.contains("BEGIN SPLINTERMAIL MESSAGE"),
        "envelope leaked to the client: {text}"
    );

    // let the teardown settle before dropping the engines
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);
    std::fs::remove_dir_all(&dir).unwrap();
}
