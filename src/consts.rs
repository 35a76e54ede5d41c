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

use std::{
    time::Instant,
    path::PathBuf,
};
use crate::util::gen_random_alphanum_string;

// This file gathers all cedana hard-coded settings

/// Bumped when the `CheckpointManifest` format changes.
pub const CURRENT_MANIFEST_VERSION: &str = "2023-10-05";

lazy_static! {
    pub static ref CEDANA_LOG_DIR: PathBuf = PathBuf::from("/var/log/cedana");

    /// Local socket for the legacy daemon channel. Owned by root, 0600.
    pub static ref DAEMON_SOCKET_PATH: PathBuf = PathBuf::from("/tmp/cedana.sock");

    pub static ref GPU_CONTROLLER_PATH: PathBuf = PathBuf::from("/usr/local/bin/gpu-controller");
    pub static ref GPU_SHARED_LIB_PATH: PathBuf = PathBuf::from("/usr/local/lib/libcedana-gpu.so");
}

/// Authoritative gRPC task service address.
pub const GRPC_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// The GPU checkpoint peer, always on loopback.
pub const GPU_SERVICE_ADDR: &str = "127.0.0.1:50051";

/// Default runc state roots, probed in order.
pub const RUNC_ROOT: &str = "/var/run/runc";
pub const CONTAINERD_RUNC_ROOT: &str = "/host/run/containerd/runc/k8s.io";
pub const K3S_RUNC_ROOT: &str = "/var/run/containerd/runc/k8s.io";

/// Name of the manifest sidecar written inside every image directory.
pub const MANIFEST_FILE_NAME: &str = "checkpoint_state.json";

/// Subdirectory of the image dir holding side copies of write-open files.
pub const OPEN_FDS_DIR_NAME: &str = "openFds";

pub const DUMP_LOG_FILE: &str = "dump.log";
pub const RESTORE_LOG_FILE: &str = "restore.log";

/// The CRIU version RPC appeared in 3.0; anything older cannot swrk for us.
pub const MIN_CRIU_VERSION: u32 = 30000;
/// cgroup v2 freezer support landed in CRIU 3.14.
pub const CRIU_CGROUP2_FREEZER_VERSION: u32 = 31400;

pub const KB: usize = 1024;

/// One CRIU response fits in a single SOCK_SEQPACKET datagram.
pub const RPC_FRAME_SIZE: usize = 40 * KB;
/// Ancillary data buffer for SCM_RIGHTS control messages.
pub const RPC_OOB_SIZE: usize = 4 * KB;

/// Exit codes surfaced by the CLI.
pub const EXIT_CODE_USAGE: u8 = 1;
pub const EXIT_CODE_RPC_FAILURE: u8 = 2;
pub const EXIT_CODE_CRIU_FAILURE: u8 = 3;

lazy_static! {
    /// The invocation ID is a random 6 digit alphanum string. It is used in:
    /// 1) The log file name
    /// 2) Restore scratch directory names
    /// 3) Emitting metrics
    pub static ref INVOCATION_ID: String = gen_random_alphanum_string(6);

    pub static ref START_TIME: Instant = Instant::now();
}
