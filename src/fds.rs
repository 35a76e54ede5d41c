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
    path::{Path, PathBuf},
};
use crate::{
    consts::*,
    error::Error,
    manifest::{FdMode, OpenFd},
    util::{copy_file, create_dir_all, tolerate_not_found},
};

// Open-FD discovery runs right before CRIU freezes the process tree.
// Two classifications matter downstream: pty slaves force shell-job mode,
// and write-open regular files get side copies in the image so restore can
// put them back byte-for-byte.

/// Reads /proc/pid/fd, resolving each link and its open mode. Fds that
/// vanish mid-scan are skipped, the process is still running after all.
pub fn scan_open_fds(pid: i32) -> Result<Vec<OpenFd>> {
    let fd_dir = PathBuf::from(format!("/proc/{}/fd", pid));
    let entries = fs::read_dir(&fd_dir).map_err(|e| Error::filesystem(
        format!("Failed to read {}", fd_dir.display()), e))?;

    let mut fds = Vec::new();
    for entry in entries {
        let entry = entry?;
        let fd: i32 = match entry.file_name().to_string_lossy().parse() {
            Ok(fd) => fd,
            Err(_) => continue,
        };

        let target = match tolerate_not_found(fs::read_link(entry.path()))? {
            Some(target) => target,
            None => continue,
        };

        let mode = match fd_mode(pid, fd)? {
            Some(mode) => mode,
            None => continue,
        };

        fds.push(OpenFd {
            fd,
            path: target.to_string_lossy().into_owned(),
            mode,
        });
    }

    Ok(fds)
}

/// Open mode from the flags line of /proc/pid/fdinfo/fd. The value is
/// octal; O_ACCMODE is the low two bits.
fn fd_mode(pid: i32, fd: i32) -> Result<Option<FdMode>> {
    let fdinfo_path = format!("/proc/{}/fdinfo/{}", pid, fd);
    let fdinfo = match tolerate_not_found(fs::read_to_string(&fdinfo_path))? {
        Some(fdinfo) => fdinfo,
        None => return Ok(None),
    };

    let flags_line = fdinfo.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .ok_or_else(|| anyhow!("No flags line in {}", fdinfo_path))?;

    let flags = u32::from_str_radix(flags_line.trim(), 8)
        .with_context(|| format!("Malformed flags in {}", fdinfo_path))?;

    Ok(Some(mode_from_flags(flags)))
}

fn mode_from_flags(flags: u32) -> FdMode {
    match (flags as i32) & libc::O_ACCMODE {
        libc::O_WRONLY => FdMode::WriteOnly,
        libc::O_RDWR => FdMode::ReadWrite,
        _ => FdMode::ReadOnly,
    }
}

/// Whether any open fd points at a pty slave.
pub fn detect_shell_job(fds: &[OpenFd]) -> bool {
    fds.iter().any(|f| f.path.contains("pts/"))
}

/// The regular files held open for writing. Sockets, pipes and deleted
/// files resolve to non-filesystem targets and drop out here.
pub fn write_open_file_paths(fds: &[OpenFd]) -> Vec<PathBuf> {
    fds.iter()
        .filter(|f| f.mode != FdMode::ReadOnly)
        .filter(|f| f.path.starts_with('/'))
        .map(|f| PathBuf::from(&f.path))
        .filter(|path| path.is_file())
        .collect()
}

/// Copies each write-open file into `<images_dir>/openFds/<basename>`.
pub fn copy_write_open_files(images_dir: &Path, paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }

    let side_copy_dir = images_dir.join(OPEN_FDS_DIR_NAME);
    create_dir_all(&side_copy_dir)?;

    for path in paths {
        // unwrap() is safe: write_open_file_paths only keeps absolute file paths
        let basename = path.file_name().unwrap();
        copy_file(path, side_copy_dir.join(basename))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fd(path: &str, mode: FdMode) -> OpenFd {
        OpenFd { fd: 0, path: path.to_owned(), mode }
    }

    #[test]
    fn accmode_classification() {
        assert_eq!(mode_from_flags(0o100000), FdMode::ReadOnly);
        assert_eq!(mode_from_flags(0o100001), FdMode::WriteOnly);
        assert_eq!(mode_from_flags(0o100002), FdMode::ReadWrite);
    }

    #[test]
    fn shell_job_from_pts() {
        assert!(detect_shell_job(&[fd("/dev/pts/0", FdMode::ReadWrite)]));
        assert!(!detect_shell_job(&[fd("/var/log/app.log", FdMode::WriteOnly)]));
    }

    #[test]
    fn write_open_paths_skip_read_only_and_virtual() {
        let dir = std::env::temp_dir().join("cedana-fds-test");
        std::fs::create_dir_all(&dir).unwrap();
        let real_file = dir.join("data.log");
        std::fs::write(&real_file, "x").unwrap();

        let fds = vec![
            fd(real_file.to_str().unwrap(), FdMode::WriteOnly),
            fd(real_file.to_str().unwrap(), FdMode::ReadOnly),
            fd("socket:[12345]", FdMode::ReadWrite),
            fd("/nonexistent/gone.log", FdMode::WriteOnly),
        ];

        assert_eq!(write_open_file_paths(&fds), vec![real_file]);
    }

    #[test]
    fn scan_own_fds() -> Result<()> {
        let fds = scan_open_fds(std::process::id() as i32)?;
        // stdin/stdout/stderr at the very least
        assert!(fds.iter().any(|f| f.fd <= 2));
        Ok(())
    }

    #[test]
    fn side_copies_land_by_basename() -> Result<()> {
        let src_dir = std::env::temp_dir().join("cedana-fds-copy-src");
        let images_dir = std::env::temp_dir().join("cedana-fds-copy-img");
        std::fs::create_dir_all(&src_dir)?;
        std::fs::create_dir_all(&images_dir)?;

        let log = src_dir.join("app.log");
        std::fs::write(&log, "log contents")?;

        copy_write_open_files(&images_dir, &[log])?;

        let copied = images_dir.join(OPEN_FDS_DIR_NAME).join("app.log");
        assert_eq!(std::fs::read_to_string(copied)?, "log contents");
        Ok(())
    }
}
