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
use std::path::PathBuf;
use structopt::StructOpt;
use serde::Serialize;
use crate::{
    metrics::with_metrics,
    service::proto::task::RestoreArgs,
};

/// Restore a process from a dumped checkpoint archive
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct Restore {
    /// Path of the checkpoint archive
    path: PathBuf,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for Restore {
    fn run(self) -> Result<()> {
        ensure!(self.path.exists(),
                "checkpoint {} does not exist", self.path.display());

        with_metrics("restore", || {
            let rt = super::runtime()?;
            let mut client = super::connect(&rt)?;

            let resp = rt.block_on(client.restore(RestoreArgs {
                checkpoint_path: self.path.to_string_lossy().into_owned(),
            }))?.into_inner();

            info!("{}", resp.message);
            Ok(resp)
        }, |resp| json!({ "restored_pid": resp.restored_pid }))?;

        Ok(())
    }
}
