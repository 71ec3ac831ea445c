/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The `citm` subcommand: listeners, the three-engine pipeline, the status
//! socket, and signal-driven shutdown.

mod listener;
pub use listener::{ListenerParseError, ListenerSpec, Scheme};

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use sm_crypto::Keypair;
use sm_engine::{EngineQueue, ImapEngine, Session, SocketEngine};
use sm_status::StatusServer;
use sm_tls::{TlsContext, TlsEngine, TlsPrestart};
use sm_types::{CitmStatus, StatusMaj, StatusMin};

use crate::citm::{KeyDir, RelayDown, RelayShared, RelayUp, SharedIgnoreList, StartTlsGate};
use crate::config::Config;
use crate::opts::exit;

const BYE_UNCONFIGURED: &[u8] = b"* BYE installation needs configuring\r\n";

const NREAD_EVENTS: usize = 16;
const NWRITE_EVENTS: usize = 16;

struct Citm {
    sock: SocketEngine,
    tls: Arc<TlsEngine>,
    imap: ImapEngine,
    server_ctx: Option<TlsContext>,
    client_ctx: TlsContext,
    keypair: Keypair,
    ignore: Arc<SharedIgnoreList>,
    remote: String,
}

pub fn citm_main(config: &Config) -> i32 {
    // fail early on a broken state directory
    if let Err(e) = check_rw_access(&config.splintermail_dir) {
        eprintln!(
            "no read/write access to {}: {e}",
            config.splintermail_dir.display()
        );
        return exit::SMDIR_NOT_WRITABLE;
    }

    let listeners = match parse_listeners(config) {
        Ok(listeners) => listeners,
        Err(code) => return code,
    };

    let server_ctx = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => match TlsContext::server(cert, key) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                eprintln!("cannot use the configured cert/key pair: {e}");
                return exit::KEY_CERT_UNPAIRED;
            }
        },
        (None, None) => None,
        _ => {
            eprintln!("--cert and --key must be given together");
            return exit::KEY_CERT_UNPAIRED;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return exit::UNCAUGHT;
        }
    };

    match runtime.block_on(run_citm(config, listeners, server_ctx)) {
        Ok(()) => exit::OK,
        Err(e) => {
            error!("citm failed: {e:#}");
            eprintln!("{e:#}");
            exit::UNCAUGHT
        }
    }
}

async fn run_citm(
    config: &Config,
    listeners: Vec<ListenerSpec>,
    server_ctx: Option<TlsContext>,
) -> anyhow::Result<()> {
    let user = config.user.clone().unwrap_or_else(|| "default".to_string());
    let account_dir = config.account_dir_for(&user);
    let keydir = KeyDir::open(&account_dir).context("opening account key directory")?;
    let ignore = Arc::new(SharedIgnoreList::load(&account_dir));

    // the pipeline: socket <-> tls <-> imap
    let sock_q = EngineQueue::new("sock");
    let tls_q = EngineQueue::new("tls");
    let imap_q = EngineQueue::new("imap");
    let sock_tx = sock_q.sender();
    let tls_tx = tls_q.sender();
    let imap_tx = imap_q.sender();

    let citm = Arc::new(Citm {
        sock: SocketEngine::new(sock_q, tls_tx.clone(), NREAD_EVENTS),
        tls: Arc::new(TlsEngine::new(
            tls_q,
            sock_tx,
            imap_tx,
            NREAD_EVENTS,
            NWRITE_EVENTS,
        )),
        imap: ImapEngine::new(imap_q, tls_tx, NWRITE_EVENTS),
        server_ctx,
        client_ctx: TlsContext::client().context("building upstream TLS context")?,
        keypair: keydir.device().clone(),
        ignore,
        remote: config.remote_imap.clone(),
    });

    // the status socket reports our configuration state
    let status_maj = match &citm.server_ctx {
        Some(_) => StatusMaj::ManualCert,
        None => StatusMaj::NeedConf,
    };
    let (status_done_tx, _status_done_rx) = flume::bounded(1);
    if let Some(parent) = config.socket.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let status_server = StatusServer::bind(
        &config.socket,
        CitmStatus::new(crate::VERSION_TUPLE, status_maj, StatusMin::None, ""),
        move || {
            // no certificate workflow is running; state is static
            debug!("status check requested");
        },
        move |err| {
            let _ = status_done_tx.try_send(err);
        },
    )
    .context("binding status socket")?;

    let mut accept_tasks = Vec::new();
    for spec in listeners {
        let tcp = TcpListener::bind(spec.addr)
            .await
            .context(format!("binding listener {spec}"))?;
        info!("listening on {spec}");
        let citm = citm.clone();
        accept_tasks.push(tokio::spawn(accept_loop(tcp, spec, citm)));
    }

    wait_for_shutdown().await;
    info!("shutting down");

    for task in &accept_tasks {
        task.abort();
    }
    status_server.close();
    citm.ignore.flush();
    citm.sock.initiate_quit();
    citm.sock.wait_quit().await;
    Ok(())
}

async fn accept_loop(tcp: TcpListener, spec: ListenerSpec, citm: Arc<Citm>) {
    loop {
        let (stream, peer) = match tcp.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed on {spec}: {e}");
                continue;
            }
        };
        debug!("connection from {peer} on {spec}");

        if spec.scheme.needs_tls() && citm.server_ctx.is_none() {
            // we cannot terminate TLS without a certificate
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(BYE_UNCONFIGURED).await;
                let _ = stream.shutdown().await;
            });
            continue;
        }

        let citm = citm.clone();
        tokio::spawn(async move {
            if let Err(e) = start_relay(stream, spec.scheme, citm).await {
                warn!("failed to set up relay for {peer}: {e}");
            }
        });
    }
}

/// Wire one client connection: an upwards session to the remote server and
/// a downwards session to the client, paired by the relay logic.
async fn start_relay(
    client_stream: TcpStream,
    scheme: Scheme,
    citm: Arc<Citm>,
) -> anyhow::Result<()> {
    let upstream = TcpStream::connect(&citm.remote)
        .await
        .context(format!("connecting to {}", citm.remote))?;
    let remote_host = citm
        .remote
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(citm.remote.as_str())
        .to_string();

    let shared = RelayShared::new();

    // upwards: we are the TLS client toward the real mail server
    let (up_session, up_owner) = Session::new(true, engine_senders(&citm), {
        let shared = shared.clone();
        move |err| {
            if let Some(err) = err {
                debug!("upwards session finished: {err}");
            }
            shared.shutdown();
        }
    });
    shared.set_up(&up_session);

    // downwards: we are the server toward the local mail client
    let (down_session, down_owner) = Session::new(false, engine_senders(&citm), {
        let shared = shared.clone();
        move |err| {
            if let Some(err) = err {
                debug!("downwards session finished: {err}");
            }
            shared.shutdown();
        }
    });
    shared.set_down(&down_session);

    // upwards wiring
    citm.tls.start_session(
        &up_session,
        TlsPrestart {
            ctx: Some(citm.client_ctx.clone()),
            verify_name: Some(remote_host),
        },
    );
    citm.imap.start_session(
        &up_session,
        Box::new(RelayUp::new(
            shared.clone(),
            citm.keypair.clone(),
            citm.ignore.clone(),
        )),
    );
    citm.sock.start_session(up_owner, upstream);

    // downwards wiring depends on the listener scheme
    match scheme {
        Scheme::Tls => {
            citm.tls.start_session(
                &down_session,
                TlsPrestart {
                    ctx: citm.server_ctx.clone(),
                    verify_name: None,
                },
            );
            citm.imap.start_session(
                &down_session,
                Box::new(RelayDown::new(shared.clone(), down_session.clone(), true)),
            );
        }
        Scheme::Insecure => {
            citm.tls.start_session(
                &down_session,
                TlsPrestart {
                    ctx: None,
                    verify_name: None,
                },
            );
            citm.imap.start_session(
                &down_session,
                Box::new(RelayDown::new(shared.clone(), down_session.clone(), true)),
            );
        }
        Scheme::StartTls => {
            citm.tls.start_session(
                &down_session,
                TlsPrestart {
                    ctx: None,
                    verify_name: None,
                },
            );
            let inner = RelayDown::new(shared.clone(), down_session.clone(), false);
            let tls = citm.tls.clone();
            let upgrade_session = down_session.clone();
            let server_ctx = citm
                .server_ctx
                .clone()
                .expect("starttls listeners require a certificate");
            let gate = StartTlsGate::new(
                down_session.clone(),
                move || tls.upgrade_session(&upgrade_session, server_ctx),
                inner,
            );
            citm.imap.start_session(&down_session, Box::new(gate));
        }
    }
    citm.sock.start_session(down_owner, client_stream);

    Ok(())
}

fn engine_senders(citm: &Citm) -> [sm_engine::EngineSender; 3] {
    [
        citm.sock.sender(),
        citm.tls.sender(),
        citm.imap.sender(),
    ]
}

fn parse_listeners(config: &Config) -> Result<Vec<ListenerSpec>, i32> {
    let mut specs = Vec::new();
    for raw in config.listeners() {
        match ListenerSpec::parse(&raw) {
            Ok(spec) => specs.push(spec),
            Err(e @ ListenerParseError::BadScheme(_)) => {
                eprintln!("{e}");
                return Err(exit::BAD_LISTENER_SCHEME);
            }
            Err(e @ ListenerParseError::BadAddr(_)) => {
                eprintln!("{e}");
                return Err(exit::BAD_LISTENER_ADDR);
            }
        }
    }
    Ok(specs)
}

fn check_rw_access(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".rw-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            // ctrl-c alone still works
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
