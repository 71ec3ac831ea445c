/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use splintermail::opts::{self, exit, Subcommand};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    openssl::init();

    let proc_args = match opts::parse_clap() {
        Ok(Some(proc_args)) => proc_args,
        Ok(None) => return exit::OK,
        Err(code) => return code,
    };

    if proc_args.dump_conf {
        print!("{}", proc_args.config.dump());
        return exit::OK;
    }

    if let Err(e) = splintermail::setup_logger(
        proc_args.config.debug,
        proc_args.config.logfile.as_deref(),
    ) {
        eprintln!("failed to set up logging: {e}");
        return exit::UNCAUGHT;
    }

    match &proc_args.subcommand {
        Subcommand::Citm => splintermail::serve::citm_main(&proc_args.config),
        Subcommand::Status => splintermail::status_cmd::status_main(&proc_args.config),
        Subcommand::Api { command, arg } => {
            splintermail::api::api_main(&proc_args.config, command, arg.as_deref())
        }
    }
}
