/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::Path;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use sm_types::{CitmStatus, Error, ErrorKind, Result, StatusUpdate};

use crate::line::{LineError, LineReader};
use crate::MAX_LINE;

enum Ctl {
    Check,
    Close,
}

/// A client of the status socket: receives the initial status and every
/// later update, and can ask the daemon to re-check its state.
pub struct StatusClient {
    ctl_tx: flume::Sender<Ctl>,
}

impl StatusClient {
    pub async fn connect(
        path: impl AsRef<Path>,
        update_cb: impl FnMut(CitmStatus) + Send + 'static,
        done_cb: impl FnOnce(Error) + Send + 'static,
    ) -> Result<StatusClient> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(Error::from)?;

        let (ctl_tx, ctl_rx) = flume::unbounded();
        tokio::spawn(run_client(stream, ctl_rx, update_cb, done_cb));

        Ok(StatusClient { ctl_tx })
    }

    /// Ask the daemon to re-examine its state; any change arrives as a
    /// regular update.
    pub fn check(&self) {
        let _ = self.ctl_tx.send(Ctl::Check);
    }

    pub fn close(&self) {
        let _ = self.ctl_tx.send(Ctl::Close);
    }
}

async fn run_client(
    stream: UnixStream,
    ctl_rx: flume::Receiver<Ctl>,
    mut update_cb: impl FnMut(CitmStatus) + Send + 'static,
    done_cb: impl FnOnce(Error) + Send + 'static,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut lines = LineReader::new(MAX_LINE);
    let mut status: Option<CitmStatus> = None;

    let err = loop {
        tokio::select! {
            r = lines.next_line(&mut reader) => {
                let line = match r {
                    Ok(Some(line)) => line,
                    Ok(None) => break Error::conn("status server closed the connection"),
                    Err(LineError::TooLong) => {
                        break Error::new(ErrorKind::Response, "oversized status line");
                    }
                    Err(LineError::Io(e)) => break Error::from(e),
                };
                match handle_line(&line, &mut status) {
                    Ok(Some(full)) => update_cb(full),
                    Ok(None) => {}
                    Err(e) => break e,
                }
            }
            r = ctl_rx.recv_async() => {
                match r {
                    Ok(Ctl::Check) => {
                        if let Err(e) = writer.write_all(b"{\"command\":\"check\"}\n").await {
                            break Error::from(e).ctx("sending check command");
                        }
                    }
                    Ok(Ctl::Close) | Err(_) => break Error::canceled(),
                }
            }
        }
    };

    debug!("status client finished: {err:?}");
    done_cb(err);
}

fn handle_line(line: &[u8], status: &mut Option<CitmStatus>) -> Result<Option<CitmStatus>> {
    match status {
        None => {
            let full: CitmStatus = serde_json::from_slice(line)
                .map_err(|e| Error::new(ErrorKind::Response, format!("bad status packet: {e}")))?;
            *status = Some(full.clone());
            Ok(Some(full))
        }
        Some(current) => {
            let update: StatusUpdate = serde_json::from_slice(line)
                .map_err(|e| Error::new(ErrorKind::Response, format!("bad status update: {e}")))?;
            update.apply_to(current);
            Ok(Some(current.clone()))
        }
    }
}
