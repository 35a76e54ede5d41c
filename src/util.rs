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
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    result::Result as StdResult,
};
use crate::error::Error;
use serde_json::Value;
use rand::{thread_rng, Rng, distributions::Alphanumeric};
use url::Url;


pub fn gen_random_alphanum_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).map_err(|e| Error::filesystem(
        format!("Failed to create directory {}", path.as_ref().display()), e).into())
}

pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    fs::copy(from.as_ref(), to.as_ref()).map_err(|e| Error::filesystem(
        format!("Failed to copy file {} to {}",
                from.as_ref().display(), to.as_ref().display()), e).into())
}

/// Joins `unsafe_path` onto `root`, refusing any path that would resolve
/// outside of `root`. Used for the runc state lookup where the container id
/// comes from an untrusted RPC argument.
pub fn secure_join(root: impl AsRef<Path>, unsafe_path: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root.as_ref();
    let unsafe_path = unsafe_path.as_ref();

    let mut joined = root.to_path_buf();
    for component in unsafe_path.components() {
        match component {
            Component::Normal(c) => joined.push(c),
            Component::CurDir => {}
            _ => return Err(Error::DescriptorInvalid(
                format!("path {} escapes {}", unsafe_path.display(), root.display())).into()),
        }
    }

    // Symlinks inside the state directory could still point anywhere.
    // Canonicalize what exists and re-check the containment.
    if let Ok(resolved) = joined.canonicalize() {
        let resolved_root = root.canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;
        if !resolved.starts_with(&resolved_root) {
            return Err(Error::DescriptorInvalid(
                format!("path {} escapes {}", unsafe_path.display(), root.display())).into());
        }
        return Ok(resolved);
    }

    Ok(joined)
}

/// Start time of `pid` in clock ticks since boot, field 22 of
/// /proc/pid/stat. Used to disambiguate PID reuse.
pub fn proc_start_time(pid: i32) -> Result<u64> {
    let stat_path = format!("/proc/{}/stat", pid);
    let stat = fs::read_to_string(&stat_path)
        .with_context(|| format!("Failed to read {}", stat_path))?;

    // The comm field may contain spaces and parentheses. Everything after
    // the last ')' is whitespace separated, with the start time at stat
    // field 22, i.e., index 19 past the closing parenthesis.
    let after_comm = stat.rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("Malformed {}", stat_path))?;

    after_comm.split_whitespace().nth(19)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| anyhow!("Malformed {}", stat_path))
}

/// Some file operations race with processes that vanish mid-scan. This
/// squashes NotFound into None, all other errors stay errors.
pub fn tolerate_not_found<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub trait IsErrorInterrupt {
    fn is_interrupt(&self) -> bool;
}

impl IsErrorInterrupt for nix::Error {
    fn is_interrupt(&self) -> bool {
        *self == nix::errno::Errno::EINTR
    }
}

impl IsErrorInterrupt for std::io::Error {
    fn is_interrupt(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

pub fn retry_on_interrupt<R, E>(mut f: impl FnMut() -> StdResult<R, E>) -> StdResult<R, E>
    where E: IsErrorInterrupt
{
    loop {
        match f() {
            Err(e) if e.is_interrupt() => {}
            other => return other,
        }
    }
}

pub trait JsonMerge {
    fn merge(self, b: Value) -> Self;
}

impl JsonMerge for Value {
    fn merge(self, b: Value) -> Self {
        match (self, b) {
            (Value::Object(mut a), Value::Object(b)) => {
                a.extend(b);
                Value::Object(a)
            }
            _ => panic!()
        }
    }
}

pub trait UrlExt {
    fn raw_join(&self, file: &str) -> Url;
}

impl UrlExt for Url {
    fn raw_join(&self, file: &str) -> Url {
        // `Url` provides a join() method, but tries to be too smart
        let mut url = self.clone();
        url.path_segments_mut()
            .expect("URL base error")
            .push(file);
        url
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secure_join_normal() -> Result<()> {
        assert_eq!(secure_join("/var/run/runc", "abcd")?,
                   PathBuf::from("/var/run/runc/abcd"));
        Ok(())
    }

    #[test]
    fn secure_join_rejects_escapes() {
        let err = secure_join("/var/run/runc", "../etc").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::DescriptorInvalid(_))));

        let err = secure_join("/var/run/runc", "/etc/passwd").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::DescriptorInvalid(_))));
    }

    #[test]
    fn fs_failures_are_typed() -> Result<()> {
        let base = std::env::temp_dir().join("cedana-util-fs-test");
        std::fs::create_dir_all(&base)?;
        let plain_file = base.join("plain");
        std::fs::write(&plain_file, "x")?;

        let err = create_dir_all(plain_file.join("sub")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::FilesystemError { .. })));

        let err = copy_file(base.join("missing"), base.join("out")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(),
                         Some(Error::FilesystemError { .. })));
        Ok(())
    }

    #[test]
    fn start_time_of_self() -> Result<()> {
        let t = proc_start_time(std::process::id() as i32)?;
        assert!(t > 0);
        Ok(())
    }

    #[test]
    fn url_join() -> Result<()> {
        let url = Url::parse("https://api.cedana.io/checkpoint/gpu")?;
        assert_eq!(url.raw_join("gpucontroller").as_str(),
                   "https://api.cedana.io/checkpoint/gpu/gpucontroller");
        Ok(())
    }
}
