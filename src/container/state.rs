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
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::error::Error;
use super::cgroup::CgroupSpec;

// The runtime's view of a running container, persisted as
// `<root>/<id>/state.json`. Field names follow the runc on-disk format.

#[derive(Deserialize, Debug)]
pub struct State {
    pub id: String,

    /// Init process id in the host pid namespace.
    pub init_process_pid: i32,

    /// Init process start time in clock ticks since boot.
    pub init_process_start: u64,

    /// Container creation time, UTC.
    pub created: DateTime<Utc>,

    pub config: ContainerConfig,

    #[serde(default)]
    pub rootless: bool,

    /// Per-controller cgroup paths; the v2 unified hierarchy uses key "".
    #[serde(default)]
    pub cgroup_paths: HashMap<String, String>,

    /// Namespace type -> bind path.
    #[serde(default)]
    pub namespace_paths: HashMap<String, String>,

    /// std{in,out,err} of the init process at creation time.
    #[serde(default)]
    pub external_descriptors: Vec<String>,

    /// Intel RDT "resource control" filesystem path, empty if absent.
    #[serde(default)]
    pub intel_rdt_path: String,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct ContainerConfig {
    pub rootfs: PathBuf,
    pub cgroups: Option<CgroupSpec>,
    pub namespaces: Vec<Namespace>,
    /// `key=value` annotations, carrying e.g. the Kubernetes container name.
    pub labels: Vec<String>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default)]
    pub path: String,
}

pub fn load(container_root: &Path) -> Result<State> {
    let state_path = container_root.join("state.json");

    let content = fs::read_to_string(&state_path).map_err(|e| Error::DescriptorInvalid(
        format!("cannot read {}: {}", state_path.display(), e)))?;

    let state: State = serde_json::from_str(&content).map_err(|e| Error::DescriptorInvalid(
        format!("cannot parse {}: {}", state_path.display(), e)))?;

    Ok(state)
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "ctr1",
        "init_process_pid": 4242,
        "init_process_start": 1234567,
        "created": "2023-09-14T10:11:12.123456789Z",
        "config": {
            "rootfs": "/var/lib/docker/overlay2/abc/merged",
            "cgroups": { "name": "ctr1", "parent": "docker", "path": "/docker/ctr1" },
            "namespaces": [ { "type": "NEWPID" }, { "type": "NEWNET", "path": "/proc/1/ns/net" } ],
            "labels": [ "io.kubernetes.cri.container-name=web" ]
        },
        "cgroup_paths": { "": "/sys/fs/cgroup/docker/ctr1" },
        "external_descriptors": [ "/dev/null", "pipe:[1]", "pipe:[2]" ],
        "intel_rdt_path": ""
    }"#;

    #[test]
    fn parse_state() -> Result<()> {
        let state: State = serde_json::from_str(SAMPLE)?;
        assert_eq!(state.init_process_pid, 4242);
        assert_eq!(state.init_process_start, 1234567);
        assert_eq!(state.config.cgroups.as_ref().unwrap().parent, "docker");
        assert_eq!(state.external_descriptors.len(), 3);
        assert!(state.intel_rdt_path.is_empty());
        assert_eq!(state.config.namespaces[1].path, "/proc/1/ns/net");
        Ok(())
    }

    #[test]
    fn load_missing_state_is_descriptor_invalid() {
        let err = load(Path::new("/nonexistent/ctr")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::DescriptorInvalid(_))));
    }
}
