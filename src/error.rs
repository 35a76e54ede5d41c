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

use std::path::PathBuf;
use thiserror::Error;

// Errors travel inside `anyhow::Error` throughout the crate. The typed kinds
// below are what the edges (CLI exit codes, gRPC status codes) downcast to.
// None of them abort the daemon; a failing RPC is the blast radius.

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    PreconditionMissing(String),

    #[error("CRIU version {found} is too old, version {minimum} or above is required")]
    CriuTooOld { found: u32, minimum: u32 },

    #[error("invalid container state: {0}")]
    DescriptorInvalid(String),

    #[error("CRIU response overflows the {limit} byte frame buffer")]
    FrameTooLarge { limit: usize },

    #[error("unexpected EOF on CRIU socket")]
    UnexpectedEof,

    #[error("unexpected CRIU response type {resp_type}")]
    UnexpectedRespType { resp_type: String },

    #[error("criu failed: type {req_type} errno {errno:?}\nlog file: {}", .log_path.display())]
    CriuError {
        req_type: String,
        errno: Option<i32>,
        log_path: PathBuf,
    },

    #[error("criu swrk {status}\nlog file: {}", .log_path.display())]
    CriuSubprocessFailed { status: String, log_path: PathBuf },

    #[error("CRIU lacks memory tracking support, cannot pre-dump")]
    MissingMemTrack,

    #[error("checkpoint_state.json not found in {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("checkpoint_state.json is corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("{context}: {source}")]
    FilesystemError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint/restore already in progress for container {0}")]
    Busy(String),

    #[error("deadline exceeded while waiting on CRIU")]
    Timeout,
}

impl Error {
    pub fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::FilesystemError { context: context.into(), source }
    }

    /// The CRIU log path associated with the failure, when one exists.
    pub fn criu_log_path(&self) -> Option<&PathBuf> {
        match self {
            Error::CriuError { log_path, .. } |
            Error::CriuSubprocessFailed { log_path, .. } => Some(log_path),
            _ => None,
        }
    }
}
