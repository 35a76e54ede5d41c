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
    env,
    fs,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    time::Instant,
};
use crate::{
    archive,
    consts::*,
    criu::{rpc, CriuOpts, SwrkSession},
    error::Error,
    manifest::{CheckpointManifest, CheckpointType},
    storage::CheckpointStorage,
    util::{copy_file, create_dir_all, gen_random_alphanum_string},
};

// Restore orchestration: unpack into a scratch dir, put the side-copied
// user files back where they were, then drive CRIU. The scratch dir is
// removed on success and deliberately kept around on failure.

/// Restores from a local archive file.
pub fn restore_path(
    archive_path: &Path,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<i32> {
    ensure!(archive_path.exists(),
            "Checkpoint archive {} does not exist", archive_path.display());

    restore_archive(archive_path, opts, deadline)
}

/// Restores from a manifest held by the managing orchestrator; the archive
/// itself comes through the injected storage.
pub fn restore_managed(
    manifest: &CheckpointManifest,
    storage: &dyn CheckpointStorage,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<i32> {
    let checkpoint_path = manifest.checkpoint_path.to_string_lossy();
    let archive_path = storage.fetch(&checkpoint_path)
        .with_context(|| format!("Failed to fetch checkpoint {}", checkpoint_path))?;

    let restored_pid = restore_archive(&archive_path, opts, deadline)?;

    // The fetched copy was scratch space.
    let _ = fs::remove_file(&archive_path);

    Ok(restored_pid)
}

fn restore_archive(
    archive_path: &Path,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<i32> {
    let scratch_dir = env::temp_dir()
        .join(format!("cedana-restore-{}", gen_random_alphanum_string(6)));

    info!("Decompressing {} to {}", archive_path.display(), scratch_dir.display());
    archive::decompress(archive_path, &scratch_dir)?;

    let result = restore_from_dir(&scratch_dir, opts, deadline);

    match &result {
        Ok(pid) => {
            info!("Restore complete, pid {}", pid);
            let _ = fs::remove_dir_all(&scratch_dir);
        }
        Err(_) => {
            // Post-mortem material: the CRIU log and images stay put.
            warn!("Restore failed, keeping {} for inspection", scratch_dir.display());
        }
    }

    result
}

fn restore_from_dir(
    images_dir: &Path,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<i32> {
    let manifest = CheckpointManifest::load(images_dir)?;

    if manifest.checkpoint_type == CheckpointType::PyTorch {
        bail!("PyTorch checkpoints are restored by the GPU controller, not this daemon");
    }

    // A process that had a pty slave open can only come back as a shell job.
    let shell_job = opts.shell_job || manifest.shell_job_detected();

    restore_files(&manifest, images_dir)?;

    let images = fs::File::open(images_dir).map_err(|e| Error::filesystem(
        format!("Failed to open directory {}", images_dir.display()), e))?;

    let rpc_opts = rpc::CriuOpts {
        images_dir_fd: images.as_raw_fd(),
        log_level: Some(4),
        log_file: Some(RESTORE_LOG_FILE.to_owned()),
        tcp_established: Some(true),
        shell_job: Some(shell_job),
        veths: opts.veth_pairs.iter().map(|pair| rpc::CriuVethPair {
            if_in: pair.container_interface_name.clone(),
            if_out: pair.host_interface_name.clone(),
        }).collect(),
        lsm_profile: opts.lsm_profile.clone(),
        lsm_mount_context: opts.lsm_mount_context.clone(),
        ..Default::default()
    };

    let session = SwrkSession::spawn(
        None,
        &[],
        Some(images_dir.join(RESTORE_LOG_FILE)),
        deadline,
    )?;

    let resp = session.exchange(rpc::CriuReq {
        r#type: rpc::CriuReqType::Restore as i32,
        opts: Some(rpc_opts),
        ..Default::default()
    })?;

    drop(images);

    Ok(resp.restore.map(|r| r.pid).unwrap_or(0))
}

/// Copies the `openFds/` side copies back to their original absolute
/// paths, recreating parent directories along the way. Files are matched
/// by basename against the manifest's write-open list.
fn restore_files(manifest: &CheckpointManifest, images_dir: &Path) -> Result<()> {
    let side_copy_dir = images_dir.join(OPEN_FDS_DIR_NAME);
    if !side_copy_dir.exists() {
        return Ok(());
    }

    let write_open_paths = &manifest.client_state.process_info.open_write_only_file_paths;

    for entry in fs::read_dir(&side_copy_dir).map_err(|e| Error::filesystem(
        format!("Failed to read {}", side_copy_dir.display()), e))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        for original in write_open_paths {
            if original.file_name() == Some(entry.file_name().as_os_str()) {
                if let Some(parent) = original.parent() {
                    create_dir_all(parent)?;
                }
                copy_file(entry.path(), original)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::manifest::{FdMode, OpenFd};

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_manifest_is_typed() {
        let dir = scratch("cedana-restore-nomanifest");
        let err = restore_from_dir(&dir, &CriuOpts::default(), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::ManifestMissing(_))));
    }

    #[test]
    fn side_copies_return_to_original_paths() -> Result<()> {
        let images_dir = scratch("cedana-restore-files-img");
        let target_root = scratch("cedana-restore-files-target");
        let original = target_root.join("logs/app.log");

        fs::create_dir_all(images_dir.join(OPEN_FDS_DIR_NAME))?;
        fs::write(images_dir.join(OPEN_FDS_DIR_NAME).join("app.log"), "line1\nline2\n")?;

        let manifest = CheckpointManifest::new(
            images_dir.clone(),
            vec![OpenFd {
                fd: 3,
                path: original.to_string_lossy().into_owned(),
                mode: FdMode::WriteOnly,
            }],
            vec![original.clone()],
        );

        restore_files(&manifest, &images_dir)?;

        assert_eq!(fs::read_to_string(&original)?, "line1\nline2\n");
        Ok(())
    }

    #[test]
    fn managed_restore_rejects_manifestless_archives() -> Result<()> {
        use crate::{archive, storage::LocalStorage};

        let base = scratch("cedana-restore-managed-test");
        let payload = base.join("images");
        fs::create_dir_all(&payload)?;
        fs::write(payload.join("pages-1.img"), "not a real image")?;

        let archive_path = base.join("ck.tar.gz");
        archive::compress(&payload, &archive_path)?;

        let manifest = CheckpointManifest::new(archive_path.clone(), vec![], vec![]);
        let err = restore_managed(&manifest, &LocalStorage,
                                  &CriuOpts::default(), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::ManifestMissing(_))));
        Ok(())
    }

    #[test]
    fn unrelated_side_copies_stay_put() -> Result<()> {
        let images_dir = scratch("cedana-restore-files-unrelated");
        fs::create_dir_all(images_dir.join(OPEN_FDS_DIR_NAME))?;
        fs::write(images_dir.join(OPEN_FDS_DIR_NAME).join("stray.log"), "x")?;

        let manifest = CheckpointManifest::new(images_dir.clone(), vec![], vec![]);
        restore_files(&manifest, &images_dir)?;
        Ok(())
    }
}
