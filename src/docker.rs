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
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use crate::{
    error::Error,
    process::{Command, Stdio},
};

// The Docker engine is a read-only inspector for us: one `docker inspect`
// per descriptor build, parsed from its JSON output. The engine API and
// socket negotiation stay the CLI's problem.

#[derive(Deserialize, Debug)]
pub struct Inspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    #[serde(rename = "State")]
    pub state: InspectState,
    #[serde(rename = "GraphDriver")]
    pub graph_driver: GraphDriver,
    #[serde(rename = "Config", default)]
    pub config: InspectConfig,
}

#[derive(Deserialize, Debug)]
pub struct InspectState {
    #[serde(rename = "Pid")]
    pub pid: i32,
    #[serde(rename = "Running", default)]
    pub running: bool,
}

#[derive(Deserialize, Debug)]
pub struct GraphDriver {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Data", default)]
    pub data: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Debug, Default)]
pub struct InspectConfig {
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
}

impl Inspect {
    /// The merged overlay filesystem root of the container.
    pub fn merged_dir(&self) -> Result<&str> {
        self.graph_driver.data.as_ref()
            .and_then(|data| data.get("MergedDir"))
            .map(String::as_str)
            .ok_or_else(|| Error::DescriptorInvalid(format!(
                "graph driver {} exposes no MergedDir", self.graph_driver.name)).into())
    }
}

pub fn inspect(container_id: &str) -> Result<Inspect> {
    let output = Command::new(&["docker", "inspect", container_id])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?
        .wait_with_output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::DescriptorInvalid(format!(
            "docker inspect {} failed: {}", container_id, stderr.trim())).into());
    }

    parse_inspect_output(&output.stdout)
        .with_context(|| format!("Failed to parse docker inspect output for {}", container_id))
}

fn parse_inspect_output(raw: &[u8]) -> Result<Inspect> {
    // `docker inspect` always prints a JSON array, one element per id.
    let mut containers: Vec<Inspect> = serde_json::from_slice(raw)?;
    ensure!(!containers.is_empty(), "docker inspect returned no containers");
    Ok(containers.remove(0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_inspect() -> Result<()> {
        let raw = br#"[{
            "Id": "deadbeefcafe",
            "Created": "2023-09-14T10:11:12.123456789Z",
            "State": { "Pid": 31337, "Running": true },
            "GraphDriver": {
                "Name": "overlay2",
                "Data": { "MergedDir": "/var/lib/docker/overlay2/abc/merged" }
            },
            "Config": { "WorkingDir": "/app" }
        }]"#;

        let inspect = parse_inspect_output(raw)?;
        assert_eq!(inspect.state.pid, 31337);
        assert_eq!(inspect.merged_dir()?, "/var/lib/docker/overlay2/abc/merged");
        assert_eq!(inspect.config.working_dir, "/app");
        Ok(())
    }

    #[test]
    fn merged_dir_missing() {
        let raw = br#"[{
            "Id": "deadbeefcafe",
            "Created": "2023-09-14T10:11:12Z",
            "State": { "Pid": 1 },
            "GraphDriver": { "Name": "devicemapper", "Data": null }
        }]"#;

        let inspect = parse_inspect_output(raw).unwrap();
        assert!(inspect.merged_dir().is_err());
    }
}
