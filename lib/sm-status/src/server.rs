/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use sm_types::{CitmStatus, Error, Result, StatusMaj, StatusMin, StatusUpdate};

use crate::line::{LineError, LineReader};
use crate::MAX_LINE;

const REJECT_TOO_LONG: &str = "{\"fail\":\"command too long\"}\n";
const REJECT_BAD_JSON: &str = "{\"status\":\"error\",\"reason\":\"invalid json\"}\n";
const REJECT_BAD_COMMAND: &str = "{\"status\":\"error\",\"reason\":\"invalid command\"}\n";
const REJECT_UNRECOGNIZED: &str = "{\"status\":\"error\",\"reason\":\"unrecognized command\"}\n";

enum Ctl {
    Update(StatusUpdate),
    Close,
}

/// The daemon side of the status socket.
///
/// One status line is pushed at connect time; afterwards the server answers
/// commands and broadcasts updates, each as one complete JSON line.
pub struct StatusServer {
    ctl_tx: flume::Sender<Ctl>,
}

impl StatusServer {
    /// Bind the socket and start serving. `check_cb` runs whenever a client
    /// asks for a re-check; `done_cb` runs once at shutdown with `Canceled`
    /// (or the listener error that killed the server).
    pub fn bind(
        path: impl AsRef<Path>,
        initial: CitmStatus,
        check_cb: impl Fn() + Send + Sync + 'static,
        done_cb: impl FnOnce(Error) + Send + 'static,
    ) -> Result<StatusServer> {
        let path = path.as_ref().to_path_buf();
        // a stale socket file from a previous run would fail the bind
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale status socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e).ctx("removing stale status socket")),
        }
        let listener = UnixListener::bind(&path).map_err(Error::from)?;

        let (ctl_tx, ctl_rx) = flume::unbounded();
        tokio::spawn(serve(path, listener, initial, ctl_rx, Arc::new(check_cb), done_cb));

        Ok(StatusServer { ctl_tx })
    }

    /// Push a new status to every connected client.
    pub fn update(&self, maj: StatusMaj, min: StatusMin, fulldomain: impl Into<String>) {
        let _ = self
            .ctl_tx
            .send(Ctl::Update(StatusUpdate::new(maj, min, fulldomain)));
    }

    /// Shut down: cancels all client connections and reports `Canceled`
    /// through the done callback.
    pub fn close(&self) {
        let _ = self.ctl_tx.send(Ctl::Close);
    }
}

async fn serve(
    path: PathBuf,
    listener: UnixListener,
    initial: CitmStatus,
    ctl_rx: flume::Receiver<Ctl>,
    check_cb: Arc<dyn Fn() + Send + Sync>,
    done_cb: impl FnOnce(Error) + Send + 'static,
) {
    let status = Arc::new(Mutex::new(initial));
    let (update_tx, _) = broadcast::channel::<StatusUpdate>(16);
    let mut conns = JoinSet::new();

    let err = loop {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _)) => {
                        let snapshot = status.lock().unwrap().clone();
                        conns.spawn(run_conn(
                            stream,
                            snapshot,
                            update_tx.subscribe(),
                            check_cb.clone(),
                        ));
                    }
                    Err(e) => break Error::from(e).ctx("status socket accept failed"),
                }
            }
            r = ctl_rx.recv_async() => {
                match r {
                    Ok(Ctl::Update(update)) => {
                        update.apply_to(&mut status.lock().unwrap());
                        // no receivers just means no clients right now
                        let _ = update_tx.send(update);
                    }
                    Ok(Ctl::Close) | Err(_) => break Error::canceled(),
                }
            }
        }
    };

    conns.abort_all();
    drop(listener);
    let _ = std::fs::remove_file(&path);
    done_cb(err);
}

async fn run_conn(
    stream: UnixStream,
    status: CitmStatus,
    mut updates: broadcast::Receiver<StatusUpdate>,
    check_cb: Arc<dyn Fn() + Send + Sync>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(MAX_LINE);

    let mut line = match serde_json::to_string(&status) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to serialize status: {e}");
            return;
        }
    };
    line.push('\n');
    if writer.write_all(line.as_bytes()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            r = lines.next_line(&mut reader) => {
                let line = match r {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(LineError::TooLong) => {
                        let _ = writer.write_all(REJECT_TOO_LONG.as_bytes()).await;
                        return;
                    }
                    Err(LineError::Io(e)) => {
                        debug!("status client read error: {e}");
                        return;
                    }
                };
                if let Some(response) = handle_command(&line, &check_cb) {
                    if writer.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            r = updates.recv() => {
                let update = match r {
                    Ok(update) => update,
                    // lagged clients miss intermediate states, not the last
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let mut line = match serde_json::to_string(&update) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn handle_command(line: &[u8], check_cb: &Arc<dyn Fn() + Send + Sync>) -> Option<&'static str> {
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(_) => return Some(REJECT_BAD_JSON),
    };
    let Some(command) = value.as_object().and_then(|o| o.get("command")) else {
        return Some(REJECT_BAD_COMMAND);
    };
    match command.as_str() {
        Some("check") => {
            check_cb();
            None
        }
        _ => Some(REJECT_UNRECOGNIZED),
    }
}
