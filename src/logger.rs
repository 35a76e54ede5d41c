//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use anyhow::Result;
use std::{
    io::prelude::*,
    io::stderr,
    sync::Mutex,
    fs,
    path::PathBuf,
};
use log::{Record, Metadata};
pub use log::LevelFilter;
use chrono::prelude::*;
use crate::{
    consts::*,
    error::Error,
    util::create_dir_all,
};

pub struct Logger {
    cmd_name: &'static str,
    log_file: Option<(fs::File, PathBuf)>,
    stderr_enabled: bool,
}

impl Logger {
    fn log(&mut self, record: &Record) {
        let msg = format!("[cedana.{}] ({:.3}s) {}\n",
            self.cmd_name, START_TIME.elapsed().as_secs_f64(), record.args());

        // When we fail to write to the outputs, we dismiss the errors.
        // Maybe there's something better to do.
        if self.stderr_enabled {
            let _ = stderr().write_all(msg.as_bytes());
        }
        let _ = self.log_file.as_mut().map(|f| f.0.write_all(msg.as_bytes()));
    }

    fn flush(&mut self) {
        let _ = stderr().flush();
        let _ = self.log_file.as_mut().map(|f| f.0.flush());
    }
}

lazy_static! {
    static ref LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
}

pub struct LoggerRef(&'static Mutex<Option<Logger>>);
impl log::Log for LoggerRef {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0.lock().unwrap().as_mut().map(|l| l.log(record));
    }

    fn flush(&self) {
        self.0.lock().unwrap().as_mut().map(|l| l.flush());
    }
}

fn open_log_file(cmd_name: &str) -> Result<(fs::File, PathBuf)> {
    create_dir_all(&*CEDANA_LOG_DIR)?;

    // The log filename carries the invocation ID. The daemon can go through
    // many dump/restore cycles, distinct files make triage easier.
    let log_file_path = CEDANA_LOG_DIR.join(
        format!("cedana-{}-{}-{}.log",
                Utc::now().format("%Y%m%d-%H%M%S"),
                cmd_name,
                &*INVOCATION_ID));

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)
        .map_err(|e| Error::filesystem(
            format!("Failed to create log file at {}", log_file_path.display()), e))?;

    Ok((log_file, log_file_path))
}

pub fn init(level: LevelFilter, cmd_name: &'static str, use_log_file: bool) -> Result<()> {
    // Initializing the logger twice would be a logic error, so it's safe to unwrap().
    log::set_boxed_logger(Box::new(LoggerRef(&LOGGER))).unwrap();
    log::set_max_level(level);

    let log_file = if use_log_file {
        Some(open_log_file(cmd_name)?)
    } else {
        None
    };

    let logger = Logger { cmd_name, log_file, stderr_enabled: false };
    LOGGER.lock().unwrap().replace(logger);

    if use_log_file {
        // We log the time, hostname and invocation ID in the log file, skipping stderr.
        let host = hostname::get().map_or_else(
            |err| format!("<{}>", err),
            |h| h.to_string_lossy().to_string());

        warn!("Time is {}", Utc::now().to_rfc2822());
        warn!("Host is {}", host);
        warn!("Invocation ID is {}", &*INVOCATION_ID);
    }

    LOGGER.lock().unwrap().as_mut().map(|l| l.stderr_enabled = true);

    Ok(())
}
