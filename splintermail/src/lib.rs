/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 Splintermail developers.
 */

pub mod api;
pub mod citm;
pub mod config;
pub mod opts;
pub mod serve;

mod build;
pub use build::{print_version, VERSION, VERSION_TUPLE};

mod logger;
pub use logger::setup_logger;

pub mod status_cmd;
