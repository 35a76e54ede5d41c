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

pub mod gpu;
pub mod task;

pub mod proto {
    pub mod task {
        tonic::include_proto!("cedana.task");
    }
    pub mod gpu {
        tonic::include_proto!("cedana.gpu");
    }
}

use anyhow::Result;
use std::net::SocketAddr;
use tonic::Status;
use crate::error::Error;
use proto::task::task_service_server::TaskServiceServer;

/// One task per RPC; a handler failing fails that RPC and nothing else.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let gpu_peer = gpu::GpuPeer::connect().await;

    info!("Task service listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(TaskServiceServer::new(task::TaskServer::new(gpu_peer)))
        .serve(addr)
        .await?;

    Ok(())
}

/// Maps the crate's typed errors onto gRPC status codes. `Internal` means
/// the daemon itself failed mid-operation (CRIU or the filesystem under
/// it), as opposed to transport or argument problems.
pub fn status_from_error(e: &anyhow::Error) -> Status {
    let message = format!("{:#}", e);

    match e.downcast_ref::<Error>() {
        Some(Error::Busy(_)) => Status::aborted(message),
        Some(Error::PreconditionMissing(_)) |
        Some(Error::CriuTooOld { .. }) => Status::failed_precondition(message),
        Some(Error::DescriptorInvalid(_)) => Status::invalid_argument(message),
        Some(Error::ManifestMissing(_)) |
        Some(Error::ManifestCorrupt(_)) => Status::failed_precondition(message),
        Some(Error::Timeout) => Status::deadline_exceeded(message),
        Some(Error::CriuError { .. }) |
        Some(Error::CriuSubprocessFailed { .. }) |
        Some(Error::FrameTooLarge { .. }) |
        Some(Error::UnexpectedEof) |
        Some(Error::UnexpectedRespType { .. }) |
        Some(Error::MissingMemTrack) |
        Some(Error::FilesystemError { .. }) => Status::internal(message),
        None => Status::unknown(message),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn status_mapping() {
        let busy: anyhow::Error = Error::Busy("ctr1".into()).into();
        assert_eq!(status_from_error(&busy).code(), tonic::Code::Aborted);

        let old: anyhow::Error = Error::CriuTooOld { found: 29999, minimum: 30000 }.into();
        assert_eq!(status_from_error(&old).code(), tonic::Code::FailedPrecondition);

        let criu: anyhow::Error = Error::CriuError {
            req_type: "DUMP".into(),
            errno: Some(22),
            log_path: PathBuf::from("/tmp/work/dump.log"),
        }.into();
        let status = status_from_error(&criu);
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("dump.log"));

        let fs_failure: anyhow::Error = Error::filesystem(
            "Failed to create directory /tmp/ck1",
            std::io::Error::from_raw_os_error(libc::EACCES)).into();
        assert_eq!(status_from_error(&fs_failure).code(), tonic::Code::Internal);

        let other: anyhow::Error = anyhow!("something else");
        assert_eq!(status_from_error(&other).code(), tonic::Code::Unknown);
    }
}
