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
    metrics::with_metrics,
    service::proto::task::{
        CriuOpts, CtrByNameArgs, RuncDumpArgs, RuncOpts, RuncRestoreArgs,
    },
};

/// Checkpoint/restore of runc-managed containers
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub enum Runc {
    Dump(RuncDump),
    Restore(RuncRestore),
    /// Look up a runc container id by its Kubernetes container name
    Get(RuncGet),
}

impl Runc {
    pub fn verbosity(&self) -> u8 {
        match self {
            Runc::Dump(RuncDump { verbose, .. }) |
            Runc::Restore(RuncRestore { verbose, .. }) |
            Runc::Get(RuncGet { verbose, .. }) => *verbose,
        }
    }
}

impl super::CLI for Runc {
    fn run(self) -> Result<()> {
        match self {
            Runc::Dump(opts) => opts.run(),
            Runc::Restore(opts) => opts.run(),
            Runc::Get(opts) => opts.run(),
        }
    }
}

/// Manually checkpoint a running runc container to a directory
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct RuncDump {
    /// Image directory the CRIU images go to
    #[structopt(short = "i", long = "image")]
    image: String,

    /// Container id
    #[structopt(short = "p", long = "id")]
    id: String,

    /// Runc root directory; probed when omitted
    #[structopt(short, long)]
    root: Option<String>,

    /// Archive path for the finished checkpoint
    #[structopt(short, long)]
    checkpoint_path: Option<String>,

    /// Checkpoint established TCP connections
    #[structopt(short, long)]
    tcp_established: bool,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for RuncDump {
    fn run(self) -> Result<()> {
        with_metrics("runc_dump", || {
            let rt = super::runtime()?;
            let mut client = super::connect(&rt)?;

            let criu_opts = CriuOpts {
                images_directory: self.image.clone(),
                leave_running: true,
                tcp_established: self.tcp_established,
                ..Default::default()
            };

            let resp = rt.block_on(client.runc_dump(RuncDumpArgs {
                root: self.root.clone().unwrap_or_default(),
                checkpoint_path: self.checkpoint_path.clone().unwrap_or_default(),
                container_id: self.id.clone(),
                criu_opts: Some(criu_opts),
            }))?.into_inner();

            info!("{}", resp.message);
            Ok(resp)
        }, |_| json!({}))?;

        Ok(())
    }
}

/// Manually restore a runc container from a checkpoint image
#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct RuncRestore {
    /// Image directory to restore from
    #[structopt(short = "i", long = "image")]
    image: String,

    /// Container id to restore as
    #[structopt(short = "p", long = "id")]
    id: String,

    /// OCI bundle path
    #[structopt(short, long)]
    bundle: String,

    /// Console socket path
    #[structopt(short, long)]
    console_socket: Option<String>,

    /// Runc root directory
    #[structopt(short, long, default_value = "/var/run/runc")]
    root: String,

    /// Run the restored container detached
    #[structopt(short, long)]
    detach: bool,

    /// The container runs under a k3s agent
    #[structopt(long = "isK3s")]
    is_k3s: bool,

    /// Network pid to restore into, for k3s sandboxes
    #[structopt(short = "n", long = "netPid", default_value = "0")]
    net_pid: i32,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for RuncRestore {
    fn run(self) -> Result<()> {
        with_metrics("runc_restore", || {
            let rt = super::runtime()?;
            let mut client = super::connect(&rt)?;

            let opts = RuncOpts {
                root: self.root.clone(),
                bundle: self.bundle.clone(),
                console_socket: self.console_socket.clone().unwrap_or_default(),
                detach: self.detach,
                net_pid: self.net_pid,
            };

            let resp = rt.block_on(client.runc_restore(RuncRestoreArgs {
                image_path: self.image.clone(),
                container_id: self.id.clone(),
                is_k3s: self.is_k3s,
                opts: Some(opts),
            }))?.into_inner();

            info!("{}", resp.message);
            Ok(resp)
        }, |_| json!({}))?;

        Ok(())
    }
}

#[derive(StructOpt, PartialEq, Debug, Serialize)]
pub struct RuncGet {
    /// Runc root directory
    #[structopt(short, long, default_value = "/var/run/runc")]
    root: String,

    /// Name of the container in k8s
    #[structopt(short, long)]
    container_name: String,

    /// Verbosity. Can be repeated
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

impl super::CLI for RuncGet {
    fn run(self) -> Result<()> {
        let rt = super::runtime()?;
        let mut client = super::connect(&rt)?;

        let resp = rt.block_on(client.get_runc_id_by_name(CtrByNameArgs {
            root: self.root,
            container_name: self.container_name,
        }))?.into_inner();

        info!("{}", resp.runc_container_id);
        Ok(())
    }
}
