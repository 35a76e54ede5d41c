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
use std::path::Path;
use crate::{
    process::Command,
    util::create_dir_all,
};

// Compression is external: the image directory is handed to tar wholesale.

lazy_static! {
    static ref TAR_CMD: String = std::env::var("TAR_CMD")
        .unwrap_or_else(|_| "tar".to_string());
}

pub fn compress(dir: &Path, archive: &Path) -> Result<()> {
    let mut cmd = Command::new(&[&*TAR_CMD]);
    if log_enabled!(log::Level::Trace) {
        cmd.arg("--verbose");
    }
    cmd.arg("--directory").arg(dir);
    cmd.args(&["--create", "--gzip", "--preserve-permissions", "--file"]);
    cmd.arg(archive);
    cmd.arg(".");

    cmd.spawn()?.wait_for_success()
}

/// Unpacks `archive` into `into`. Archives written by older clients end
/// with a truncated gzip trailer; extraction errors are logged and
/// tolerated, the manifest check right after catches real corruption.
pub fn decompress(archive: &Path, into: &Path) -> Result<()> {
    create_dir_all(into)?;

    let mut cmd = Command::new(&[&*TAR_CMD]);
    if log_enabled!(log::Level::Trace) {
        cmd.arg("--verbose");
    }
    cmd.arg("--directory").arg(into);
    cmd.args(&["--extract", "--gzip", "--preserve-permissions", "--file"]);
    cmd.arg(archive);

    if let Err(e) = cmd.spawn()?.wait_for_success() {
        info!("Tolerating decompression error for {}: {:#}", archive.display(), e);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() -> Result<()> {
        let base = std::env::temp_dir().join("cedana-archive-test");
        let src = base.join("src");
        let out = base.join("out");
        std::fs::create_dir_all(&src)?;
        std::fs::create_dir_all(src.join("openFds"))?;
        std::fs::write(src.join("checkpoint_state.json"), "{}")?;
        std::fs::write(src.join("openFds/app.log"), "payload")?;

        let archive = base.join("ck.tar.gz");
        compress(&src, &archive)?;
        decompress(&archive, &out)?;

        assert_eq!(std::fs::read_to_string(out.join("checkpoint_state.json"))?, "{}");
        assert_eq!(std::fs::read_to_string(out.join("openFds/app.log"))?, "payload");
        Ok(())
    }

    #[test]
    fn truncated_archive_is_tolerated() -> Result<()> {
        let base = std::env::temp_dir().join("cedana-archive-trunc-test");
        std::fs::create_dir_all(&base)?;
        let archive = base.join("bad.tar.gz");
        std::fs::write(&archive, b"\x1f\x8b\x08\x00")?;

        // Errors are logged, not returned.
        decompress(&archive, &base.join("out"))?;
        Ok(())
    }
}
