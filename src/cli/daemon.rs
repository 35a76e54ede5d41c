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

use anyhow::{Result, Context};
use structopt::StructOpt;
use serde::Serialize;
use crate::{
    config::Config,
    daemon,
    error::Error,
};

/// Run the cedana daemon. Must be run as root, needed for all other
/// cedana functionality.
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub enum Daemon {
    /// Start the RPC servers. To run as a daemon, use systemd/sysv/upstart.
    Start(Start),
}

impl Daemon {
    pub fn verbosity(&self) -> u8 {
        match self {
            Daemon::Start(Start { verbose, .. }) => *verbose,
        }
    }
}

impl super::CLI for Daemon {
    fn run(self) -> Result<()> {
        match self {
            Daemon::Start(opts) => opts.run(),
        }
    }
}

#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct Start {
    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for Start {
    fn run(self) -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            return Err(Error::PreconditionMissing(
                "the daemon must run as root".to_owned()).into());
        }

        let config = Config::load()?;

        info!("daemon version {} starting", env!("CARGO_PKG_VERSION"));

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to start the async runtime")?;

        rt.block_on(daemon::run(config))
    }
}
