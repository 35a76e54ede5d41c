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

use anyhow::{Result, Context};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use serde::{Serialize, Deserialize};
use crate::error::Error;

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";

/// Cgroup placement of a container, as recorded by the runtime.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CgroupSpec {
    pub name: String,
    pub parent: String,
    pub path: String,
    pub systemd: bool,
}

/// The slice of cgroup management this crate needs: path resolution for
/// the freezer, and moving the CRIU child next to the frozen processes.
/// The real manager library stays behind this seam.
pub trait CgroupManager: Send + Sync {
    /// Absolute cgroup paths keyed by controller name; the unified v2
    /// hierarchy uses the empty key.
    fn paths(&self) -> &HashMap<String, PathBuf>;

    /// The cgroup CRIU should freeze, when one resolves.
    fn freezer_path(&self) -> Option<PathBuf>;

    /// Moves `pid` into the resolved cgroups. A manager without resolvable
    /// paths is a no-op.
    fn apply(&self, pid: i32) -> Result<()>;
}

pub struct FsManager {
    paths: HashMap<String, PathBuf>,
}

impl FsManager {
    /// Built from the paths the runtime recorded in state.json.
    pub fn from_paths(paths: HashMap<String, String>) -> Self {
        Self {
            paths: paths.into_iter()
                .map(|(ctrl, path)| (ctrl, PathBuf::from(path)))
                .collect(),
        }
    }

    /// Built from a spec alone, mounted under /sys/fs/cgroup. This is what
    /// the Docker path gets: no recorded per-controller paths.
    pub fn from_spec(spec: &CgroupSpec) -> Self {
        let relative = spec.path.trim_start_matches('/');
        let mut paths = HashMap::new();
        if is_cgroup2_unified_mode() {
            paths.insert(String::new(), Path::new(CGROUP_MOUNT).join(relative));
        } else {
            paths.insert("freezer".to_owned(),
                         Path::new(CGROUP_MOUNT).join("freezer").join(relative));
        }
        Self { paths }
    }
}

impl CgroupManager for FsManager {
    fn paths(&self) -> &HashMap<String, PathBuf> {
        &self.paths
    }

    fn freezer_path(&self) -> Option<PathBuf> {
        if is_cgroup2_unified_mode() {
            self.paths.get("").cloned()
        } else {
            self.paths.get("freezer").cloned()
        }
    }

    fn apply(&self, pid: i32) -> Result<()> {
        for (ctrl, path) in &self.paths {
            let procs_file = path.join("cgroup.procs");
            match fs::write(&procs_file, format!("{}\n", pid)) {
                Ok(()) => {}
                // The controller dir may be gone or never mounted.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Skipping cgroup {:?} for pid {}: {} not present",
                           ctrl, pid, procs_file.display());
                }
                Err(e) => return Err(e).with_context(||
                    format!("Failed to write {}", procs_file.display())),
            }
        }
        Ok(())
    }
}

pub fn is_cgroup2_unified_mode() -> bool {
    use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};
    statfs(CGROUP_MOUNT)
        .map(|fs| fs.filesystem_type() == CGROUP2_SUPER_MAGIC)
        .unwrap_or(false)
}

/// Parses /proc/pid/cgroup content into controller-set -> cgroup path.
/// Lines are `hierarchy-ID:controller-list:path`; the v2 unified entry
/// carries an empty controller list.
pub fn parse_proc_cgroup(content: &str) -> HashMap<String, String> {
    let mut paths = HashMap::new();
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(_id), Some(ctrls), Some(path)) =
            (fields.next(), fields.next(), fields.next()) else { continue };
        for ctrl in ctrls.split(',') {
            paths.insert(ctrl.to_owned(), path.to_owned());
        }
    }
    paths
}

/// Synthesizes a cgroup spec for a process from its unified-hierarchy
/// line, `/<parent>/<name>/...`. Kubernetes-style paths with a `.slice`
/// segment mark a systemd-driven hierarchy.
pub fn spec_from_unified_path(path: &str) -> Result<CgroupSpec> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 3 {
        return Err(Error::DescriptorInvalid(
            format!("cgroup path {} is too shallow to name a container", path)).into());
    }

    let parent = parts[1].to_owned();
    let name = parts[2].to_owned();
    let systemd = parts.iter().any(|seg| seg.ends_with(".slice"));

    Ok(CgroupSpec {
        path: format!("/{}/{}", parent, name),
        name,
        parent,
        systemd,
    })
}

pub fn spec_from_proc(pid: i32) -> Result<CgroupSpec> {
    let proc_path = format!("/proc/{}/cgroup", pid);
    let content = fs::read_to_string(&proc_path)
        .with_context(|| format!("Failed to read {}", proc_path))?;

    let paths = parse_proc_cgroup(&content);
    let unified = paths.get("").ok_or_else(|| Error::DescriptorInvalid(
        format!("{} has no unified hierarchy entry", proc_path)))?;

    spec_from_unified_path(unified)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn proc_cgroup_unified_line() {
        let paths = parse_proc_cgroup("0::/kubepods/podabc/ctr123\n");
        assert_eq!(paths.get(""), Some(&"/kubepods/podabc/ctr123".to_owned()));
    }

    #[test]
    fn proc_cgroup_v1_lines() {
        let content = "\
12:freezer:/docker/deadbeef
11:cpu,cpuacct:/docker/deadbeef
0::/docker/deadbeef
";
        let paths = parse_proc_cgroup(content);
        assert_eq!(paths.get("freezer"), Some(&"/docker/deadbeef".to_owned()));
        assert_eq!(paths.get("cpu"), Some(&"/docker/deadbeef".to_owned()));
        assert_eq!(paths.get("cpuacct"), Some(&"/docker/deadbeef".to_owned()));
        assert_eq!(paths.get(""), Some(&"/docker/deadbeef".to_owned()));
    }

    #[test]
    fn spec_from_path() -> Result<()> {
        let spec = spec_from_unified_path("/kubepods/podabc/ctr123")?;
        assert_eq!(spec.parent, "kubepods");
        assert_eq!(spec.name, "podabc");
        assert_eq!(spec.path, "/kubepods/podabc");
        assert!(!spec.systemd);
        Ok(())
    }

    #[test]
    fn spec_detects_systemd_slices() -> Result<()> {
        let spec = spec_from_unified_path(
            "/system.slice/docker-deadbeef.scope/payload")?;
        assert!(spec.systemd);
        Ok(())
    }

    #[test]
    fn spec_rejects_shallow_paths() {
        let err = spec_from_unified_path("/init").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::DescriptorInvalid(_))));
    }

    #[test]
    fn apply_without_paths_is_noop() -> Result<()> {
        let manager = FsManager::from_paths(HashMap::new());
        manager.apply(1)?;
        Ok(())
    }
}
