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

pub mod cgroup;
pub mod init;
pub mod state;

use anyhow::Result;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};
use chrono::{DateTime, Utc};
use crate::{
    consts::*,
    criu,
    docker,
    error::Error,
    util::{proc_start_time, secure_join},
};
use cgroup::{CgroupManager, FsManager};
use init::InitProcess;
use state::ContainerConfig;

/// The uniform in-memory description of a container, produced before any
/// CRIU call. The runc and Docker acquisition paths both end here; the
/// dump/restore core never knows which one built it.
pub struct ContainerDesc {
    pub id: String,
    /// Runtime state directory holding this container's state.json, or the
    /// closest Docker equivalent.
    pub root: PathBuf,
    pub pid: i32,
    pub init: InitProcess,
    pub rootfs: PathBuf,
    pub config: ContainerConfig,
    pub cgroup: Box<dyn CgroupManager>,
    pub intel_rdt_path: Option<PathBuf>,
    pub criu_version: u32,
    pub created_at: DateTime<Utc>,
    lock: Arc<Mutex<()>>,
}

// Descriptors are rebuilt per RPC, so the serialization point lives in a
// process-wide registry keyed by container id. Two RPCs for the same
// container contend on the same mutex no matter which path built them.
lazy_static! {
    static ref CONTAINER_LOCKS: Mutex<HashMap<String, Arc<Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

fn lock_for(id: &str) -> Arc<Mutex<()>> {
    CONTAINER_LOCKS.lock().unwrap()
        .entry(id.to_owned())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

impl ContainerDesc {
    /// Serializes dump/restore per container. Fails fast with `Busy`
    /// instead of queueing; callers are expected to retry.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, ()>> {
        match self.lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(Error::Busy(self.id.clone()).into()),
        }
    }
}

/// A recorded pid may have been recycled since the state was captured.
/// The start time in /proc is the tie breaker.
fn verify_against_proc(init: &InitProcess, container_id: &str) -> Result<()> {
    let live_start_time = proc_start_time(init.pid()).map_err(|_| {
        Error::DescriptorInvalid(format!(
            "container {} init process {} is gone", container_id, init.pid()))
    })?;

    if live_start_time != init.start_time()? {
        return Err(Error::DescriptorInvalid(format!(
            "stale state for container {}: pid {} was reused",
            container_id, init.pid())).into());
    }

    Ok(())
}

/// The std{in,out,err} targets of a live process, in fd order. Fds closed
/// by the process simply drop out.
fn std_fd_links(pid: i32) -> Vec<String> {
    (0..3).filter_map(|fd| {
        std::fs::read_link(format!("/proc/{}/fd/{}", pid, fd)).ok()
            .map(|target| target.to_string_lossy().into_owned())
    }).collect()
}

/// CRIU needs a populated filesystem root to dump against.
fn validate_rootfs(rootfs: &Path, container_id: &str) -> Result<()> {
    let mut entries = std::fs::read_dir(rootfs).map_err(|_| Error::DescriptorInvalid(
        format!("rootfs {} of container {} does not exist", rootfs.display(), container_id)))?;

    if entries.next().is_none() {
        return Err(Error::DescriptorInvalid(format!(
            "rootfs {} of container {} is empty", rootfs.display(), container_id)).into());
    }

    Ok(())
}

/// First existing default runc root wins.
pub fn probe_runc_root() -> Result<PathBuf> {
    for root in [RUNC_ROOT, CONTAINERD_RUNC_ROOT] {
        if Path::new(root).exists() {
            return Ok(PathBuf::from(root));
        }
    }
    Err(Error::DescriptorInvalid(format!(
        "no runc root found, tried {} and {}", RUNC_ROOT, CONTAINERD_RUNC_ROOT)).into())
}

/// Builds a descriptor from the runc state directory. `root_dir` overrides
/// the default probing order.
pub fn from_runc(container_id: &str, root_dir: Option<&Path>) -> Result<ContainerDesc> {
    // Both acquisition paths leave criu_version populated or fail outright.
    let criu_version = criu::criu_version()?;

    let root = match root_dir {
        Some(root) => root.to_path_buf(),
        None => probe_runc_root()?,
    };

    let container_root = secure_join(&root, container_id)?;
    let state = state::load(&container_root)?;

    let init = InitProcess::AdoptedFromDisk {
        pid: state.init_process_pid,
        start_time: state.init_process_start,
        fds: state.external_descriptors.clone(),
    };
    verify_against_proc(&init, container_id)?;

    validate_rootfs(&state.config.rootfs, container_id)?;

    let cgroup = FsManager::from_paths(state.cgroup_paths.clone());

    Ok(ContainerDesc {
        lock: lock_for(container_id),
        id: container_id.to_owned(),
        root: container_root,
        pid: init.pid(),
        init,
        rootfs: state.config.rootfs.clone(),
        intel_rdt_path: if state.intel_rdt_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&state.intel_rdt_path))
        },
        config: state.config,
        cgroup: Box::new(cgroup),
        criu_version,
        created_at: state.created,
    })
}

/// Pieces a descriptor together from what the Docker engine exposes. Only
/// the rootfs makes it into the config: namespaces and mounts are not
/// reconstructed on this path, callers needing them must go through runc.
pub fn from_docker(container_id: &str) -> Result<ContainerDesc> {
    let criu_version = criu::criu_version()?;

    let inspect = docker::inspect(container_id)?;
    if inspect.state.pid <= 0 {
        return Err(Error::DescriptorInvalid(format!(
            "container {} is not running", container_id)).into());
    }

    let rootfs = PathBuf::from(inspect.merged_dir()?);
    validate_rootfs(&rootfs, container_id)?;

    let cgroup_spec = cgroup::spec_from_proc(inspect.state.pid)?;
    let cgroup = FsManager::from_spec(&cgroup_spec);

    let config = ContainerConfig {
        rootfs: rootfs.clone(),
        cgroups: Some(cgroup_spec),
        ..Default::default()
    };

    let start_time = proc_start_time(inspect.state.pid).map_err(|_| {
        Error::DescriptorInvalid(format!(
            "container {} init process {} is gone", container_id, inspect.state.pid))
    })?;
    let init = InitProcess::AdoptedFromDisk {
        pid: inspect.state.pid,
        start_time,
        // Docker records no descriptor triple; the live std{in,out,err}
        // links are the closest equivalent.
        fds: std_fd_links(inspect.state.pid),
    };

    Ok(ContainerDesc {
        lock: lock_for(container_id),
        id: container_id.to_owned(),
        root: PathBuf::from(inspect.config.working_dir),
        pid: init.pid(),
        init,
        rootfs,
        config,
        cgroup: Box::new(cgroup),
        intel_rdt_path: None,
        criu_version,
        created_at: inspect.created,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_id_contends_on_one_lock() {
        let a = lock_for("lock-test-ctr");
        let b = lock_for("lock-test-ctr");
        let guard = a.try_lock().unwrap();
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }

    #[test]
    fn std_fd_links_of_self() {
        let links = std_fd_links(std::process::id() as i32);
        assert!(!links.is_empty());
    }

    #[test]
    fn different_ids_do_not_contend() {
        let a = lock_for("lock-test-a");
        let b = lock_for("lock-test-b");
        let _guard_a = a.try_lock().unwrap();
        assert!(b.try_lock().is_ok());
    }
}
