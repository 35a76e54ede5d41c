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
    fs,
    path::Path,
};
use crate::{
    consts::*,
    container::state,
    process::Command,
    util::secure_join,
};

// Restoring a runc-managed container goes through the runtime's own
// restore command: runc owns namespace setup and the OCI bundle contract,
// we own the image directory it consumes.

#[derive(Default, Clone, Debug)]
pub struct RuncOpts {
    pub root: String,
    pub bundle: String,
    pub console_socket: String,
    pub detach: bool,
    pub net_pid: i32,
}

pub fn restore_container(
    image_path: &str,
    container_id: &str,
    opts: &RuncOpts,
    is_k3s: bool,
) -> Result<()> {
    let root = if is_k3s {
        K3S_RUNC_ROOT
    } else if opts.root.is_empty() {
        RUNC_ROOT
    } else {
        opts.root.as_str()
    };

    let mut cmd = Command::new(&["runc"]);
    cmd.args(&["--root", root]);
    cmd.args(&["restore", "--image-path", image_path, "--bundle", opts.bundle.as_str()]);

    if !opts.console_socket.is_empty() {
        cmd.args(&["--console-socket", opts.console_socket.as_str()]);
    }
    if opts.detach {
        cmd.arg("--detach");
    }
    if opts.net_pid > 0 {
        // Join the network namespace of an existing pid, the k3s sandbox case.
        cmd.arg("--network-namespace")
            .arg(format!("/proc/{}/ns/net", opts.net_pid));
    }
    cmd.arg(container_id);

    cmd.spawn()?
        .wait_for_success()
        .with_context(|| format!("runc restore of {} failed", container_id))
}

/// Finds the runc container id carrying the Kubernetes container-name
/// annotation `name`, by scanning every state.json under `root`.
pub fn get_id_by_name(root: &Path, name: &str) -> Result<Option<String>> {
    let label = format!("io.kubernetes.cri.container-name={}", name);

    let entries = fs::read_dir(root)
        .with_context(|| format!("Failed to read runc root {}", root.display()))?;

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().into_owned();
        let container_root = secure_join(root, &id)?;
        let state = match state::load(&container_root) {
            Ok(state) => state,
            // Containers churn; a half-written or vanished state is not ours.
            Err(_) => continue,
        };

        if state.config.labels.iter().any(|l| l == &label) {
            return Ok(Some(id));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn write_state(root: &Path, id: &str, name: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("state.json"), format!(r#"{{
            "id": "{id}",
            "init_process_pid": 1,
            "init_process_start": 1,
            "created": "2023-09-14T10:11:12Z",
            "config": {{
                "rootfs": "/rootfs",
                "labels": ["io.kubernetes.cri.container-name={name}"]
            }}
        }}"#)).unwrap();
    }

    #[test]
    fn id_lookup_by_k8s_name() -> Result<()> {
        let root = PathBuf::from(std::env::temp_dir()).join("cedana-runc-name-test");
        let _ = fs::remove_dir_all(&root);
        write_state(&root, "abc123", "web");
        write_state(&root, "def456", "sidecar");

        assert_eq!(get_id_by_name(&root, "sidecar")?, Some("def456".to_owned()));
        assert_eq!(get_id_by_name(&root, "nothere")?, None);
        Ok(())
    }
}
