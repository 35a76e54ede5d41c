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

mod daemon;
mod dump;
mod main;
mod restore;
mod runc;

use anyhow::{Result, Context};
use tonic::transport::Channel;
use crate::consts::*;
use crate::service::proto::task::task_service_client::TaskServiceClient;

pub trait CLI {
    fn run(self) -> anyhow::Result<()>;
}

pub use main::Opts;

/// Exit codes: 0 success, 1 usage, 2 RPC/transport failure, 3 CRIU
/// failure. The daemon reserves the Internal status code for failures of
/// the operation itself (CRIU, or the filesystem under it), which is what
/// we key off here; its message carries the CRIU log path when one exists.
pub struct ExitCode;

impl ExitCode {
    pub fn from_error(e: &anyhow::Error) -> u8 {
        if let Some(status) = e.downcast_ref::<tonic::Status>() {
            return match status.code() {
                tonic::Code::Internal => EXIT_CODE_CRIU_FAILURE,
                _ => EXIT_CODE_RPC_FAILURE,
            };
        }
        if e.downcast_ref::<tonic::transport::Error>().is_some() {
            return EXIT_CODE_RPC_FAILURE;
        }
        EXIT_CODE_USAGE
    }
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
}

pub(crate) fn connect(rt: &tokio::runtime::Runtime) -> Result<TaskServiceClient<Channel>> {
    rt.block_on(TaskServiceClient::connect(format!("http://{}", GRPC_LISTEN_ADDR)))
        .with_context(|| format!(
            "could not connect to the daemon at {}, running as root?", GRPC_LISTEN_ADDR))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        let criu_failure: anyhow::Error = tonic::Status::internal("criu failed").into();
        assert_eq!(ExitCode::from_error(&criu_failure), EXIT_CODE_CRIU_FAILURE);

        let busy: anyhow::Error = tonic::Status::aborted("busy").into();
        assert_eq!(ExitCode::from_error(&busy), EXIT_CODE_RPC_FAILURE);

        let local: anyhow::Error = anyhow!("no dump directory specified");
        assert_eq!(ExitCode::from_error(&local), EXIT_CODE_USAGE);
    }
}
