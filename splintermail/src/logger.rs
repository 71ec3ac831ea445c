/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

enum Output {
    Stderr,
    File(Mutex<std::fs::File>),
}

struct ProcessLogger {
    output: Output,
}

impl Log for ProcessLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let line = format!("{level} {}: {}\n", record.target(), record.args());
        match &self.output {
            Output::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Output::File(file) => {
                let mut file = file.lock().unwrap();
                let _ = file.write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Output::File(file) = &self.output {
            let _ = file.lock().unwrap().flush();
        }
    }
}

/// Install the process logger: stderr by default, or an append-mode logfile.
pub fn setup_logger(debug: bool, logfile: Option<&Path>) -> anyhow::Result<()> {
    let output = match logfile {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Output::File(Mutex::new(file))
        }
        None => Output::Stderr,
    };
    log::set_boxed_logger(Box::new(ProcessLogger { output }))?;
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    Ok(())
}
