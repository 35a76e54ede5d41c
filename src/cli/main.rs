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
use structopt::{StructOpt, clap::AppSettings};
use serde::Serialize;
use crate::logger;
use super::{
    CLI,
    daemon::Daemon,
    dump::Dump,
    restore::Restore,
    runc::Runc,
};

#[derive(StructOpt, PartialEq, Debug, Serialize)]
#[structopt(
    // When showing --help, we want to keep the order of arguments as we defined,
    // as opposed to the default alphabetical order.
    global_setting(AppSettings::DeriveDisplayOrder),
    // help subcommand is not useful, disable it.
    global_setting(AppSettings::DisableHelpSubcommand),
    // subcommand version is not useful, disable it.
    global_setting(AppSettings::VersionlessSubcommands),
)]
pub struct Opts {
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, PartialEq, Debug, Serialize)]
enum Command {
    Dump(Dump),
    Restore(Restore),
    Runc(Runc),
    Daemon(Daemon),
}

impl Opts {
    // It looks a bit silly not to have a global verbose option flag, but if we
    // use a global flag, then the user _must_ pass --verbose before the
    // subcommand, which is even more silly.
    fn verbosity(&self) -> u8 {
        match &self.command {
            Command::Dump(Dump { verbose, .. }) |
            Command::Restore(Restore { verbose, .. }) => *verbose,
            Command::Runc(runc) => runc.verbosity(),
            Command::Daemon(daemon) => daemon.verbosity(),
        }
    }

    fn log_level(&self) -> logger::LevelFilter {
        match self.verbosity() {
            0 => logger::LevelFilter::Info,
            1 => logger::LevelFilter::Debug,
            _ => logger::LevelFilter::Trace,
        }
    }

    fn log_prefix(&self) -> &'static str {
        match self.command {
            Command::Dump(_)    => "dump",
            Command::Restore(_) => "restore",
            Command::Runc(_)    => "runc",
            Command::Daemon(_)  => "daemon",
        }
    }

    fn use_log_file(&self) -> bool {
        // The daemon runs detached; the log file is the only trace of what
        // it did across its dump/restore cycles.
        matches!(self.command, Command::Daemon(_))
    }

    pub fn init_logger(&self) -> Result<()> {
        logger::init(self.log_level(), self.log_prefix(), self.use_log_file())
    }
}

impl CLI for Opts {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Dump(opts)    => opts.run(),
            Command::Restore(opts) => opts.run(),
            Command::Runc(opts)    => opts.run(),
            Command::Daemon(opts)  => opts.run(),
        }
    }
}
