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
use std::path::PathBuf;

// Blob storage for checkpoint archives is an external collaborator. The
// managed restore path receives an implementation of this trait; the rest
// of the crate only ever sees a local file.

pub trait CheckpointStorage: Send + Sync {
    /// Materializes the archive behind `checkpoint_path` on the local
    /// filesystem and returns where it landed.
    fn fetch(&self, checkpoint_path: &str) -> Result<PathBuf>;
}

/// Archives already on disk, the common case for the ad-hoc CLI flows.
pub struct LocalStorage;

impl CheckpointStorage for LocalStorage {
    fn fetch(&self, checkpoint_path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(checkpoint_path);
        ensure!(path.exists(), "Checkpoint archive {} does not exist", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_fetch_requires_existing_file() -> Result<()> {
        let base = std::env::temp_dir().join("cedana-storage-test");
        std::fs::create_dir_all(&base)?;
        let archive = base.join("ck.tar.gz");
        std::fs::write(&archive, "x")?;

        let storage = LocalStorage;
        assert_eq!(storage.fetch(archive.to_str().unwrap())?, archive);
        assert!(storage.fetch("/nonexistent/ck.tar.gz").is_err());
        Ok(())
    }
}
