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
    io::Result as IoResult,
    ffi::OsStr,
    os::unix::io::RawFd,
    process::Command as StdCommand,
    os::unix::process::CommandExt,
};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::dup2,
};
use super::Process;

// We re-export these, as they are part of our API
pub use std::process::{ExitStatus, Stdio};

// We wrap the standard library `Command` to provide additional features:
// * Logging of the command executed, and failures
// * Passing inherited file descriptors at fixed child-side indices, which
//   is how `criu swrk` receives its RPC socket (fd 3)
// We have to delegate a few methods to the inner `StdCommand`, which makes
// it a bit verbose.

pub struct Command {
    inner: StdCommand,
    display_args: Vec<String>,
    show_cmd_on_spawn: bool,
    inherited_fds: Vec<RawFd>,
}

impl Command {
    pub fn new<I: IntoIterator<Item = S>, S: AsRef<OsStr>>(args: I) -> Self {
        let mut args = args.into_iter();
        let program = args.next().unwrap(); // unwrap() is fine as we never pass empty args
        let mut cmd = Self {
            inner: StdCommand::new(&program),
            display_args: vec![Self::arg_for_display(&program)],
            show_cmd_on_spawn: true,
            inherited_fds: Vec::new(),
        };
        cmd.args(args);
        cmd
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.display_args.push(Self::arg_for_display(&arg));
        self.inner.arg(&arg);
        self
    }

    pub fn arg_for_display<S: AsRef<OsStr>>(arg: S) -> String {
        arg.as_ref().to_string_lossy().into_owned()
    }

    pub fn args<I: IntoIterator<Item = S>, S: AsRef<OsStr>>(&mut self, args: I) -> &mut Self {
        for arg in args { self.arg(arg); }
        self
    }

    pub fn show_cmd_on_spawn(&mut self, value: bool) -> &mut Self {
        self.show_cmd_on_spawn = value;
        self
    }

    /// The i-th fd of `fds` shows up in the child as fd 3+i, CLOEXEC
    /// cleared, mirroring the ExtraFiles convention of other runtimes.
    pub fn inherited_fds(&mut self, fds: &[RawFd]) -> &mut Self {
        self.inherited_fds = fds.to_vec();

        let fds = self.inherited_fds.clone();
        let pre_exec_fn = move || -> IoResult<()> {
            for (i, &fd) in fds.iter().enumerate() {
                let target = 3 + i as RawFd;
                if fd == target {
                    // Already in place, just clear CLOEXEC.
                    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                        .map_err(std::io::Error::from)?;
                } else {
                    // dup2 clears CLOEXEC on the duplicate.
                    dup2(fd, target).map_err(std::io::Error::from)?;
                }
            }
            Ok(())
        };
        // unsafe: our pre_exec hook does not touch malloc. It's okay.
        unsafe { self.pre_exec(pre_exec_fn) };
        self
    }

    pub fn spawn(&mut self) -> Result<Process> {
        let display_cmd = self.display_args.join(" ");
        let inner = self.inner.spawn()
            .with_context(|| format!("Failed to spawn `{}`", display_cmd))?;
        if self.show_cmd_on_spawn {
            debug!("+ {}", display_cmd);
        }

        Ok(Process::new(inner, display_cmd))
    }
}

// These are delegates to the inner `StdCommand`.
impl Command {
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, val: V) -> &mut Command
        { self.inner.env(key, val); self }
    pub fn current_dir<P: AsRef<std::path::Path>>(&mut self, dir: P) -> &mut Command
        { self.inner.current_dir(dir); self }
    pub fn stdin<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Command
        { self.inner.stdin(cfg); self }
    pub fn stdout<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Command
        { self.inner.stdout(cfg); self }
    pub fn stderr<T: Into<Stdio>>(&mut self, cfg: T) -> &mut Command
        { self.inner.stderr(cfg); self }
    #[allow(clippy::missing_safety_doc)]
    pub unsafe fn pre_exec<F>(&mut self, f: F) -> &mut Command
        where
        F: FnMut() -> IoResult<()> + Send + Sync + 'static
        { self.inner.pre_exec(f); self }
}
