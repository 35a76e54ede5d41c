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
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    time::Instant,
};
use crate::{
    consts::*,
    container::ContainerDesc,
    criu::{self, rpc, CriuOpts, SwrkSession},
    error::Error,
    fds,
    manifest::CheckpointManifest,
};

// Dump orchestration: fd discovery and the manifest land in the image dir
// first, then CRIU is driven over swrk. Checkpointing the same container
// multiple times reuses the image directory.

/// Checkpoints a container described by `desc`. The pre-dump/dump split,
/// parent image chaining and the freezer choice all happen here.
pub fn dump_container(
    desc: &ContainerDesc,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<()> {
    let _guard = desc.try_lock()?;

    // The descriptor may have gone stale between build and dump.
    desc.init.signal(None).map_err(|_| Error::DescriptorInvalid(format!(
        "container {} init process {} is gone", desc.id, desc.init.pid())))?;

    let result = do_dump(Some(desc), desc.init.pid(), desc.criu_version, opts, deadline);

    // A dump interrupted before the manifest was written leaves nothing
    // worth keeping behind.
    if result.is_err() && !opts.images_dir.join(MANIFEST_FILE_NAME).exists() {
        let _ = fs::remove_dir_all(&opts.images_dir);
    }

    result
}

/// Checkpoints a bare process: same flow, no container wrapping. Returns
/// the image directory for the caller to archive.
pub fn dump_process(
    pid: i32,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<()> {
    let criu_version = criu::criu_version()?;

    let result = do_dump(None, pid, criu_version, opts, deadline);

    if result.is_err() && !opts.images_dir.join(MANIFEST_FILE_NAME).exists() {
        let _ = fs::remove_dir_all(&opts.images_dir);
    }

    result
}

/// Where the compressed image of `images_dir` goes by default.
pub fn default_archive_path(images_dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tar.gz", images_dir.display()))
}

fn do_dump(
    desc: Option<&ContainerDesc>,
    pid: i32,
    criu_version: u32,
    opts: &CriuOpts,
    deadline: Option<Instant>,
) -> Result<()> {
    // We rely on the CRIU version RPC, introduced with CRIU 3.0.0.
    if criu_version < MIN_CRIU_VERSION {
        return Err(Error::CriuTooOld {
            found: criu_version,
            minimum: MIN_CRIU_VERSION,
        }.into());
    }

    ensure!(!opts.images_dir.as_os_str().is_empty(), "No images directory to dump into");

    // Containers get checkpointed multiple times, the directory may exist.
    let images_dir = create_and_open_dir(&opts.images_dir)?;
    let work_dir = opts.work_dir.as_deref().map(create_and_open_dir).transpose()?;

    // Open-fd discovery runs before CRIU quiesces anything: pty slaves
    // force shell-job mode, write-open files get side copies, and the
    // manifest records both for the restore side.
    let open_fds = fds::scan_open_fds(pid)?;
    let shell_job = opts.shell_job || fds::detect_shell_job(&open_fds);
    let write_open_paths = fds::write_open_file_paths(&open_fds);
    fds::copy_write_open_files(&opts.images_dir, &write_open_paths)?;

    let abs_images_dir = opts.images_dir.canonicalize().map_err(|e| Error::filesystem(
        format!("Failed to resolve {}", opts.images_dir.display()), e))?;
    CheckpointManifest::new(abs_images_dir, open_fds, write_open_paths)
        .save(&opts.images_dir)?;

    let mut rpc_opts = rpc::CriuOpts {
        images_dir_fd: images_dir.as_raw_fd(),
        work_dir_fd: work_dir.as_ref().map(|d| d.as_raw_fd()),
        log_level: Some(4),
        log_file: Some(DUMP_LOG_FILE.to_owned()),
        manage_cgroups: Some(true),
        notify_scripts: Some(false),
        pid: Some(pid),
        orphan_pts_master: Some(true),
        shell_job: Some(shell_job),
        leave_running: Some(opts.leave_running),
        tcp_established: Some(opts.tcp_established),
        ext_unix_sk: Some(opts.ext_unix_conns),
        file_locks: Some(opts.file_locks),
        empty_ns: Some(opts.empty_ns_mask),
        auto_dedup: Some(opts.auto_dedup),
        lazy_pages: Some(opts.lazy_pages),
        status_fd: opts.status_fd,
        lsm_profile: opts.lsm_profile.clone(),
        lsm_mount_context: opts.lsm_mount_context.clone(),
        ..Default::default()
    };

    if let Some(desc) = desc {
        rpc_opts.root = Some(desc.rootfs.to_string_lossy().into_owned());

        // When the freezer is not available CRIU falls back to
        // ptrace-based quiescing.
        if freezer_usable(criu_version) {
            if let Some(freezer) = desc.cgroup.freezer_path() {
                rpc_opts.freeze_cgroup = Some(freezer.to_string_lossy().into_owned());
            }
        }
    }

    // A pre-dump chain tracks memory against the parent image.
    if let Some(parent_image) = &opts.parent_image {
        rpc_opts.parent_img = Some(parent_image.clone());
        rpc_opts.track_mem = Some(true);
    }

    if let Some(mode) = opts.manage_cgroups_mode {
        rpc_opts.manage_cgroups_mode = Some(rpc::CriuCgMode::from(mode) as i32);
    }

    let req_type = if opts.pre_dump {
        if !criu::mem_track_available()? {
            return Err(Error::MissingMemTrack.into());
        }
        rpc::CriuReqType::PreDump
    } else {
        rpc::CriuReqType::Dump
    };

    let log_path = opts.work_dir.as_deref()
        .unwrap_or(&opts.images_dir)
        .join(DUMP_LOG_FILE);

    info!("Dumping pid {} to {} ({})",
          pid, opts.images_dir.display(),
          if opts.pre_dump { "pre-dump" } else { "dump" });

    let session = SwrkSession::spawn(
        desc.map(|d| d.cgroup.as_ref()),
        &[],
        Some(log_path),
        deadline,
    )?;

    session.exchange(rpc::CriuReq {
        r#type: req_type as i32,
        opts: Some(rpc_opts),
        ..Default::default()
    })?;

    // The directory fds must outlive the session: CRIU resolves them
    // through our /proc while it runs.
    drop(images_dir);
    drop(work_dir);

    info!("Dump of pid {} complete", pid);
    Ok(())
}

fn freezer_usable(criu_version: u32) -> bool {
    // cgroup v2 freezer support needs CRIU 3.14; v1 always works.
    !crate::container::cgroup::is_cgroup2_unified_mode()
        || criu_version >= CRIU_CGROUP2_FREEZER_VERSION
}

fn create_and_open_dir(path: &Path) -> Result<fs::File> {
    match fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::filesystem(
            format!("Failed to create directory {}", path.display()), e).into()),
    }

    fs::File::open(path).map_err(|e| Error::filesystem(
        format!("Failed to open directory {}", path.display()), e).into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_gate_boundary() {
        let opts = CriuOpts {
            images_dir: PathBuf::from("/tmp/cedana-version-gate-test"),
            ..Default::default()
        };

        let err = do_dump(None, 1, MIN_CRIU_VERSION - 1, &opts, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::CriuTooOld { found: 29999, .. })));
    }

    #[test]
    fn empty_images_dir_is_rejected() {
        let opts = CriuOpts::default();
        assert!(do_dump(None, 1, MIN_CRIU_VERSION, &opts, None).is_err());
    }

    #[test]
    fn dir_creation_is_idempotent() -> Result<()> {
        let dir = std::env::temp_dir().join("cedana-dump-dir-test");
        let _ = fs::remove_dir_all(&dir);

        create_and_open_dir(&dir)?;
        create_and_open_dir(&dir)?;
        Ok(())
    }

    #[test]
    fn default_archive_path_appends_suffix() {
        assert_eq!(default_archive_path(Path::new("/tmp/ck1")),
                   PathBuf::from("/tmp/ck1.tar.gz"));
    }
}
