/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command, ValueHint};

use crate::config::Config;

const ARG_VERSION: &str = "version";
const ARG_CONFIG: &str = "config";
const ARG_DEBUG: &str = "debug";
const ARG_DUMP_CONF: &str = "dump-conf";
const ARG_SOCKET: &str = "socket";
const ARG_SM_DIR: &str = "splintermail-dir";
const ARG_LOGFILE: &str = "logfile";
const ARG_NO_LOGFILE: &str = "no-logfile";
const ARG_LISTEN: &str = "listen";
const ARG_CERT: &str = "cert";
const ARG_KEY: &str = "key";
const ARG_USER: &str = "user";
const ARG_ACCOUNT_DIR: &str = "account-dir";
const ARG_SUBCOMMAND: &str = "subcommand";
const ARG_SUBCOMMAND_ARG: &str = "arg";

/// Exit codes of the splintermail binary; stable, scripts depend on them.
pub mod exit {
    pub const OK: i32 = 0;
    pub const BAD_CLI: i32 = 1;
    pub const BAD_CONFIG: i32 = 2;
    pub const NO_SUBCOMMAND: i32 = 3;
    pub const NO_USER: i32 = 5;
    pub const PASSWORD_MISMATCH: i32 = 6;
    pub const TOKEN_REGISTRATION_FAILED: i32 = 7;
    pub const CONFIRMATION_FAILED: i32 = 8;
    pub const TOKEN_REJECTED: i32 = 9;
    pub const API_FAILURE: i32 = 14;
    pub const BAD_LISTENER_SCHEME: i32 = 15;
    pub const BAD_LISTENER_ADDR: i32 = 16;
    pub const TOKEN_CORRUPTED: i32 = 17;
    pub const KEY_CERT_UNPAIRED: i32 = 18;
    pub const SMDIR_NOT_WRITABLE: i32 = 19;
    pub const ALREADY_CONFIGURED: i32 = 20;
    pub const TOS_DECLINED: i32 = 22;
    pub const UNCAUGHT: i32 = 125;
}

#[derive(Debug, Clone)]
pub enum Subcommand {
    /// Run the local gateway daemon.
    Citm,
    /// Report daemon status over the status socket.
    Status,
    /// Any REST API command, passed through with its optional argument.
    Api { command: String, arg: Option<String> },
}

#[derive(Debug)]
pub struct ProcArgs {
    pub config: Config,
    pub subcommand: Subcommand,
    pub dump_conf: bool,
}

fn build_cli_args() -> Command {
    Command::new(crate::build::PKG_NAME)
        .disable_version_flag(true)
        .arg(
            Arg::new(ARG_VERSION)
                .help("Show version")
                .action(ArgAction::SetTrue)
                .short('v')
                .long(ARG_VERSION),
        )
        .arg(
            Arg::new(ARG_CONFIG)
                .help("Config file path")
                .num_args(1)
                .value_name("FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .short('c')
                .long(ARG_CONFIG),
        )
        .arg(
            Arg::new(ARG_DEBUG)
                .help("Show debug-level logs")
                .action(ArgAction::SetTrue)
                .short('D')
                .long(ARG_DEBUG),
        )
        .arg(
            Arg::new(ARG_DUMP_CONF)
                .help("Print the effective configuration and exit")
                .action(ArgAction::SetTrue)
                .long(ARG_DUMP_CONF),
        )
        .arg(
            Arg::new(ARG_SOCKET)
                .help("Status socket path")
                .num_args(1)
                .value_name("PATH")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .short('s')
                .long(ARG_SOCKET),
        )
        .arg(
            Arg::new(ARG_SM_DIR)
                .help("Directory for keys, tokens and per-user state")
                .num_args(1)
                .value_name("DIR")
                .value_hint(ValueHint::DirPath)
                .value_parser(value_parser!(PathBuf))
                .short('d')
                .long(ARG_SM_DIR),
        )
        .arg(
            Arg::new(ARG_LOGFILE)
                .help("Log file path")
                .num_args(1)
                .value_name("FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .short('l')
                .long(ARG_LOGFILE),
        )
        .arg(
            Arg::new(ARG_NO_LOGFILE)
                .help("Log to stderr only")
                .action(ArgAction::SetTrue)
                .short('L')
                .long(ARG_NO_LOGFILE),
        )
        .arg(
            Arg::new(ARG_LISTEN)
                .help("Listener spec, SCHEME://HOST:PORT; repeatable")
                .num_args(1)
                .value_name("SPEC")
                .action(ArgAction::Append)
                .long(ARG_LISTEN),
        )
        .arg(
            Arg::new(ARG_CERT)
                .help("TLS certificate file for listeners")
                .num_args(1)
                .value_name("FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .long(ARG_CERT),
        )
        .arg(
            Arg::new(ARG_KEY)
                .help("TLS key file for listeners")
                .num_args(1)
                .value_name("FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .long(ARG_KEY),
        )
        .arg(
            Arg::new(ARG_USER)
                .help("Act as this splintermail account")
                .num_args(1)
                .value_name("USER")
                .short('u')
                .long(ARG_USER),
        )
        .arg(
            Arg::new(ARG_ACCOUNT_DIR)
                .help("Override the per-account state directory")
                .num_args(1)
                .value_name("DIR")
                .value_hint(ValueHint::DirPath)
                .value_parser(value_parser!(PathBuf))
                .short('a')
                .long(ARG_ACCOUNT_DIR),
        )
        .arg(
            Arg::new(ARG_SUBCOMMAND)
                .help("citm, status, or an API command name")
                .num_args(1)
                .value_name("SUBCOMMAND"),
        )
        .arg(
            Arg::new(ARG_SUBCOMMAND_ARG)
                .help("Argument to the API command")
                .num_args(1)
                .value_name("ARG"),
        )
}

/// Parse the command line and merge it over the config files. Returns
/// `Ok(None)` when the invocation was fully handled (e.g. `--version`), or
/// `Err(exit_code)` after printing a diagnostic.
pub fn parse_clap() -> Result<Option<ProcArgs>, i32> {
    let matches = build_cli_args().try_get_matches().map_err(|e| {
        let code = match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                exit::OK
            }
            _ => exit::BAD_CLI,
        };
        let _ = e.print();
        code
    })?;

    if matches.get_flag(ARG_VERSION) {
        crate::build::print_version(1);
        return Ok(None);
    }

    let explicit_config = matches.get_one::<PathBuf>(ARG_CONFIG).cloned();
    let mut config = match Config::load(explicit_config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return Err(exit::BAD_CONFIG);
        }
    };

    // the command line overrides every config source
    if matches.get_flag(ARG_DEBUG) {
        config.debug = true;
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_SOCKET) {
        config.socket = path.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_SM_DIR) {
        config.splintermail_dir = path.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_LOGFILE) {
        config.logfile = Some(path.clone());
    }
    if matches.get_flag(ARG_NO_LOGFILE) {
        config.logfile = None;
    }
    if let Some(listens) = matches.get_many::<String>(ARG_LISTEN) {
        config.listen = listens.cloned().collect();
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_CERT) {
        config.cert = Some(path.clone());
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_KEY) {
        config.key = Some(path.clone());
    }
    if let Some(user) = matches.get_one::<String>(ARG_USER) {
        config.user = Some(user.clone());
    }
    if let Some(path) = matches.get_one::<PathBuf>(ARG_ACCOUNT_DIR) {
        config.account_dir = Some(path.clone());
    }

    let dump_conf = matches.get_flag(ARG_DUMP_CONF);

    let subcommand = match matches.get_one::<String>(ARG_SUBCOMMAND) {
        Some(name) if name == "citm" => Subcommand::Citm,
        Some(name) if name == "status" => Subcommand::Status,
        Some(name) => Subcommand::Api {
            command: name.clone(),
            arg: matches.get_one::<String>(ARG_SUBCOMMAND_ARG).cloned(),
        },
        None => {
            if dump_conf {
                // --dump-conf needs no subcommand
                Subcommand::Citm
            } else {
                eprintln!("missing subcommand; try `splintermail citm`");
                return Err(exit::NO_SUBCOMMAND);
            }
        }
    };

    Ok(Some(ProcArgs {
        config,
        subcommand,
        dump_conf,
    }))
}
