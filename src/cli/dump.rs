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
use structopt::StructOpt;
use serde::Serialize;
use crate::{
    config::Config,
    metrics::with_metrics,
    service::proto::task::DumpArgs,
};

/// Directly checkpoint a running process to a directory
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct Dump {
    /// Pid of the process to checkpoint
    pid: i32,

    /// Directory to dump to, defaults to the configured shared storage dir
    #[structopt(short, long)]
    dir: Option<String>,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for Dump {
    fn run(self) -> Result<()> {
        let config = Config::load()?;

        let dir = match self.dir {
            Some(dir) => dir,
            None if !config.shared_storage.dump_storage_dir.is_empty() =>
                config.shared_storage.dump_storage_dir.clone(),
            None => bail!("no dump directory specified"),
        };

        with_metrics("dump", || {
            let rt = super::runtime()?;
            let mut client = super::connect(&rt)?;

            let resp = rt.block_on(client.dump(DumpArgs { pid: self.pid, dir }))?
                .into_inner();

            info!("{}", resp.message);
            Ok(resp)
        }, |resp| json!({ "checkpoint_path": resp.checkpoint_path }))?;

        Ok(())
    }
}
