/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

//! The `status` subcommand: one-shot report over the status socket.

use log::debug;

use sm_status::StatusClient;

use crate::config::Config;
use crate::opts::exit;

pub fn status_main(config: &Config) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return exit::UNCAUGHT;
        }
    };

    runtime.block_on(async {
        let (update_tx, update_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);

        let client = match StatusClient::connect(
            &config.socket,
            move |status| {
                let _ = update_tx.try_send(status);
            },
            move |err| {
                let _ = done_tx.try_send(err);
            },
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                eprintln!(
                    "unable to reach the splintermail daemon at {}: {e}",
                    config.socket.display()
                );
                eprintln!("is `splintermail citm` running?");
                return exit::UNCAUGHT;
            }
        };

        let status = tokio::select! {
            r = update_rx.recv_async() => match r {
                Ok(status) => status,
                Err(_) => return exit::UNCAUGHT,
            },
            r = done_rx.recv_async() => {
                if let Ok(err) = r {
                    eprintln!("status connection failed: {err}");
                }
                return exit::UNCAUGHT;
            }
        };

        println!(
            "splintermail server version: {}.{}.{}",
            status.version_maj, status.version_min, status.version_patch
        );
        if !status.fulldomain.is_empty() {
            println!("subdomain: {}", status.fulldomain);
        }
        if status.minor.is_empty() {
            println!("status: {}", status.major);
        } else {
            println!("status: {}: {}", status.major, status.minor);
        }

        client.close();
        debug!("status report complete");
        exit::OK
    })
}
