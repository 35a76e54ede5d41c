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
    time::{Duration, Instant},
    os::unix::process::ExitStatusExt,
    convert::TryFrom,
};
use nix::{
    sys::signal::{self, Signal}, unistd::Pid,
};

pub use std::process::{ExitStatus, Stdio, Child};

// We create our own `Child` wrapper to provide better error context
// and a slightly different API than what is offered from the stdlib.

pub struct Process {
    inner: Child,
    display_cmd: String,
}

impl Process {
    pub fn new(inner: Child, display_cmd: String) -> Self {
        Self { inner, display_cmd }
    }

    pub fn pid(&self) -> i32 { self.inner.id() as i32 }

    pub fn kill(&self, signal: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(self.pid()), signal)
            .with_context(|| format!("Failed to signal pid={}", self.pid()))
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.inner.try_wait()
            .with_context(|| format!("wait(pid={}) failed", self.pid()))
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.inner.wait()
            .with_context(|| format!("wait(pid={}) failed", self.pid()))
    }

    pub fn wait_timeout(&mut self, until: Instant) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(exit_status) = self.try_wait()? {
                return Ok(Some(exit_status));
            }

            if Instant::now() > until {
                return Ok(None);
            }

            std::thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn wait_for_success(&mut self) -> Result<()> {
        let exit_status = self.wait()?;
        ensure_successful_exit_status(exit_status, &self.display_cmd)
    }

    pub fn wait_with_output(self) -> Result<Output> {
        let Process { display_cmd, inner } = self;

        let result = inner.wait_with_output()?;

        Ok(Output {
            status: result.status,
            stdout: result.stdout,
            stderr: result.stderr,
            display_cmd,
        })
    }

    pub fn display_cmd(&self) -> &str { &self.display_cmd }
}

pub struct Output {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub display_cmd: String,
}

impl Output {
    pub fn ensure_success(&self) -> Result<()> {
        ensure_successful_exit_status(self.status, &self.display_cmd)
    }
}

pub fn format_exit_status(exit_status: ExitStatus) -> String {
    if let Some(exit_code) = exit_status.code() {
        format!("failed with exit_code={}", exit_code)
    } else if let Some(signal) = exit_status.signal() {
        let signal = Signal::try_from(signal)
            .map_or_else(|_| format!("signal {}", signal), |s| s.to_string());
        format!("caught fatal {}", signal)
    } else {
        format!("Unexpected child exit status {:?}", exit_status)
    }
}

fn ensure_successful_exit_status(exit_status: ExitStatus, display_cmd: &str) -> Result<()> {
    if exit_status.success() {
        Ok(())
    } else {
        bail!("`{}` {}", display_cmd, format_exit_status(exit_status));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::super::*;

    #[test]
    fn test_failed_exit_code() -> Result<()> {
        let mut cmd = Command::new(&["false"]).spawn()?;
        let err_msg = cmd.wait_for_success().unwrap_err().to_string();

        assert!(err_msg.contains("exit_code=1"));

        Ok(())
    }

    #[test]
    fn test_args() -> Result<()> {
        let out = Command::new(&["echo", "-n", "hello"])
            .stdout(Stdio::piped())
            .spawn()?
            .wait_with_output()?
            .stdout;

        assert_eq!(String::from_utf8_lossy(&out), "hello");

        Ok(())
    }
}
