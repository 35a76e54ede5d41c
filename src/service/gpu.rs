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

use tonic::{transport::Channel, Status};
use crate::consts::*;
use super::proto::gpu::{
    cedana_gpu_client::CedanaGpuClient,
    CheckpointRequest, CheckpointResponse,
};

/// The GPU checkpoint peer on loopback. An unreachable peer degrades GPU
/// checkpointing to `Unavailable`; the task service itself is unaffected.
pub struct GpuPeer {
    client: Option<CedanaGpuClient<Channel>>,
}

impl GpuPeer {
    pub async fn connect() -> Self {
        let endpoint = format!("http://{}", GPU_SERVICE_ADDR);
        let client = match CedanaGpuClient::connect(endpoint).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("GPU peer at {} unreachable ({}), GPU checkpointing degraded",
                      GPU_SERVICE_ADDR, e);
                None
            }
        };
        Self { client }
    }

    pub async fn checkpoint(&self, directory: String, pid: i32)
        -> Result<CheckpointResponse, Status>
    {
        let mut client = self.client.clone().ok_or_else(|| {
            Status::unavailable(format!("GPU service at {} is not reachable", GPU_SERVICE_ADDR))
        })?;

        let resp = client.checkpoint(CheckpointRequest { directory, pid }).await?;
        Ok(resp.into_inner())
    }
}
