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
    fs,
    path::{Path, PathBuf},
};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::{
    consts::*,
    error::Error,
};

// The manifest is the `checkpoint_state.json` sidecar written into every
// image directory. It describes what was open at capture time, and which
// files travel alongside the CRIU images in `openFds/`.

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CheckpointManifest {
    pub version: String,
    pub checkpoint_type: CheckpointType,
    /// Absolute image directory path at capture time.
    pub checkpoint_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub client_state: ClientState,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointType {
    #[serde(rename = "CRIU")]
    Criu,
    #[serde(rename = "PyTorch")]
    PyTorch,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClientState {
    pub process_info: ProcessInfo,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProcessInfo {
    pub open_fds: Vec<OpenFd>,
    /// Paths from `open_fds` open for writing, restored byte-for-byte from
    /// their `openFds/<basename>` side copies.
    pub open_write_only_file_paths: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OpenFd {
    pub fd: i32,
    pub path: String,
    pub mode: FdMode,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdMode {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "WO")]
    WriteOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

impl CheckpointManifest {
    pub fn new(
        checkpoint_path: PathBuf,
        open_fds: Vec<OpenFd>,
        open_write_only_file_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            version: String::from(CURRENT_MANIFEST_VERSION),
            checkpoint_type: CheckpointType::Criu,
            checkpoint_path,
            created_at: Utc::now(),
            client_state: ClientState {
                process_info: ProcessInfo { open_fds, open_write_only_file_paths },
            },
        }
    }

    /// A process holding a pty slave open must be restored as a shell job.
    pub fn shell_job_detected(&self) -> bool {
        self.client_state.process_info.open_fds.iter()
            .any(|f| f.path.contains("pts/"))
    }

    pub fn to_json(&self) -> String {
        // unwrap() is safe. The JSON serialization can't fail.
        serde_json::to_string_pretty(self).unwrap()
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        fs::write(&path, self.to_json()).map_err(|e| Error::filesystem(
            format!("Failed to write {}", path.display()), e).into())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            return Err(Error::ManifestMissing(dir.to_path_buf()).into());
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::filesystem(
            format!("Failed to read {}", path.display()), e))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ManifestCorrupt(e.to_string()).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> CheckpointManifest {
        CheckpointManifest::new(
            PathBuf::from("/tmp/ck1"),
            vec![
                OpenFd { fd: 0, path: "/dev/pts/0".to_owned(), mode: FdMode::ReadWrite },
                OpenFd { fd: 3, path: "/var/log/app.log".to_owned(), mode: FdMode::WriteOnly },
            ],
            vec![PathBuf::from("/var/log/app.log")],
        )
    }

    #[test]
    fn round_trip() -> Result<()> {
        let dir = std::env::temp_dir().join("cedana-manifest-test");
        std::fs::create_dir_all(&dir)?;

        let manifest = sample();
        manifest.save(&dir)?;
        let loaded = CheckpointManifest::load(&dir)?;

        assert_eq!(loaded.checkpoint_type, CheckpointType::Criu);
        assert_eq!(loaded.client_state.process_info.open_fds,
                   manifest.client_state.process_info.open_fds);
        Ok(())
    }

    #[test]
    fn wire_names_are_stable() {
        let json = sample().to_json();
        assert!(json.contains("\"CRIU\""));
        assert!(json.contains("\"WO\""));
        assert!(json.contains("\"open_write_only_file_paths\""));
    }

    #[test]
    fn missing_manifest() {
        let err = CheckpointManifest::load(Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::ManifestMissing(_))));
    }

    #[test]
    fn corrupt_manifest() -> Result<()> {
        let dir = std::env::temp_dir().join("cedana-manifest-corrupt-test");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(MANIFEST_FILE_NAME), "not json at all")?;

        let err = CheckpointManifest::load(&dir).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::ManifestCorrupt(_))));
        Ok(())
    }

    #[test]
    fn shell_job_detection() {
        let manifest = sample();
        assert!(manifest.shell_job_detected());

        let quiet = CheckpointManifest::new(PathBuf::from("/tmp/ck2"), vec![
            OpenFd { fd: 1, path: "/var/log/app.log".to_owned(), mode: FdMode::WriteOnly },
        ], vec![]);
        assert!(!quiet.shell_job_detected());
    }
}
