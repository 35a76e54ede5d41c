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

pub mod rpc;
mod engine;

pub use engine::SwrkSession;

use anyhow::Result;
use std::{
    path::PathBuf,
    sync::Mutex,
    time::{Duration, Instant},
};

/// User-level knobs for a dump or restore. These turn on/off the flags
/// passed down to CRIU; the orchestrators own the rest of the composition.
#[derive(Default, Clone, Debug)]
pub struct CriuOpts {
    /// Directory for storing image files. Required.
    pub images_dir: PathBuf,
    /// Directory CRIU cds into for logs/pidfiles/stats. CRIU default when unset.
    pub work_dir: Option<PathBuf>,
    /// Directory of parent image files for pre-dump and dump.
    pub parent_image: Option<String>,
    /// Leave the processes running after checkpoint.
    pub leave_running: bool,
    /// Checkpoint/restore established TCP connections.
    pub tcp_established: bool,
    /// Allow external unix connections.
    pub ext_unix_conns: bool,
    /// Allow dump and restore of shell jobs (pty slaves).
    pub shell_job: bool,
    /// Handle file locks held by the processes.
    pub file_locks: bool,
    /// Perform an iterative pre-dump instead of a full dump.
    pub pre_dump: bool,
    /// Veth pairs handed to CRIU on restore.
    pub veth_pairs: Vec<VethPairName>,
    /// Cgroup management mode override.
    pub manage_cgroups_mode: Option<CgMode>,
    /// Namespaces whose properties are not checkpointed, as a CLONE_* mask.
    pub empty_ns_mask: u32,
    /// Auto deduplication for incremental dumps.
    pub auto_dedup: bool,
    /// Restore memory pages lazily using userfaultfd.
    pub lazy_pages: bool,
    /// Fd CRIU writes \0 to once the lazy-pages server is ready.
    pub status_fd: Option<i32>,
    /// LSM profile applied on restore.
    pub lsm_profile: Option<String>,
    /// LSM mount context value applied on restore.
    pub lsm_mount_context: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VethPairName {
    pub container_interface_name: String,
    pub host_interface_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgMode {
    Soft,
    Full,
    Strict,
    Ignore,
}

impl CgMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soft" => Some(Self::Soft),
            "full" => Some(Self::Full),
            "strict" => Some(Self::Strict),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

impl From<CgMode> for rpc::CriuCgMode {
    fn from(mode: CgMode) -> Self {
        match mode {
            CgMode::Soft => rpc::CriuCgMode::Soft,
            CgMode::Full => rpc::CriuCgMode::Full,
            CgMode::Strict => rpc::CriuCgMode::Strict,
            CgMode::Ignore => rpc::CriuCgMode::Ignore,
        }
    }
}

// The CRIU version and feature set are process-wide: CRIU is a single
// binary, probing it once per lifetime is enough. Both caches are written
// once and treated as immutable afterwards.
lazy_static! {
    static ref CRIU_VERSION: Mutex<Option<u32>> = Mutex::new(None);
    static ref CRIU_FEATURES: Mutex<Option<rpc::CriuFeatures>> = Mutex::new(None);
}

/// Version probes run against an otherwise idle CRIU, they answer quickly.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// CRIU version as major*10000 + minor*100 + patch, cached for the process
/// lifetime. Fails with `PreconditionMissing` when CRIU is not installed.
pub fn criu_version() -> Result<u32> {
    let mut cached = CRIU_VERSION.lock().unwrap();
    if let Some(version) = *cached {
        return Ok(version);
    }

    let session = SwrkSession::spawn(None, &[], None, Some(Instant::now() + PROBE_TIMEOUT))?;
    let resp = session.exchange(rpc::CriuReq {
        r#type: rpc::CriuReqType::Version as i32,
        ..Default::default()
    })?;

    let v = resp.version
        .ok_or_else(|| anyhow!("CRIU version response carries no version"))?;
    let version = v.major_number as u32 * 10000
        + v.minor_number as u32 * 100
        + v.sublevel.unwrap_or(0) as u32;

    debug!("Using CRIU {}", version);
    *cached = Some(version);
    Ok(version)
}

/// Whether CRIU supports memory tracking (the pre-dump prerequisite).
/// The first call issues a FEATURE_CHECK, later calls hit the cache.
pub fn mem_track_available() -> Result<bool> {
    if let Some(features) = &*CRIU_FEATURES.lock().unwrap() {
        return Ok(features.mem_track.unwrap_or(false));
    }

    let session = SwrkSession::spawn(None, &[], None, Some(Instant::now() + PROBE_TIMEOUT))?;
    let resp = session.exchange(rpc::CriuReq {
        r#type: rpc::CriuReqType::FeatureCheck as i32,
        features: Some(rpc::CriuFeatures {
            mem_track: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    })?;

    let features = resp.features
        .ok_or_else(|| anyhow!("CRIU feature check response carries no features"))?;
    let mem_track = features.mem_track.unwrap_or(false);

    let mut cached = CRIU_FEATURES.lock().unwrap();
    if cached.is_none() {
        cached.replace(features);
    }
    Ok(mem_track)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cg_mode_parse() {
        assert_eq!(CgMode::parse("soft"), Some(CgMode::Soft));
        assert_eq!(CgMode::parse("strict"), Some(CgMode::Strict));
        assert_eq!(CgMode::parse("props"), None);
        assert_eq!(CgMode::parse(""), None);
    }

    #[test]
    fn cg_mode_wire_values() {
        assert_eq!(rpc::CriuCgMode::from(CgMode::Soft) as i32, 3);
        assert_eq!(rpc::CriuCgMode::from(CgMode::Full) as i32, 4);
        assert_eq!(rpc::CriuCgMode::from(CgMode::Ignore) as i32, 0);
    }
}
