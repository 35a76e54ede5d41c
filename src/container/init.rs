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
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use crate::{
    process::Process,
    util::proc_start_time,
};

/// The container's init process, as seen from the daemon.
///
/// A process adopted from a state file was never our child: it cannot be
/// started, terminated or waited on, only observed and signaled. Those
/// mutators simply do not exist on `AdoptedFromDisk`, the variant carries
/// the recorded identity and nothing else.
pub enum InitProcess {
    /// Spawned by this daemon (`StartTask`); full child-process control.
    InitiatedHere {
        process: Process,
        fds: Vec<String>,
    },

    /// Reconstructed from `state.json` or an inspect call.
    AdoptedFromDisk {
        pid: i32,
        start_time: u64,
        fds: Vec<String>,
    },
}

impl InitProcess {
    pub fn pid(&self) -> i32 {
        match self {
            InitProcess::InitiatedHere { process, .. } => process.pid(),
            InitProcess::AdoptedFromDisk { pid, .. } => *pid,
        }
    }

    /// Start time in clock ticks since boot. For an adopted process this is
    /// the recorded value; a live process is consulted through /proc.
    pub fn start_time(&self) -> Result<u64> {
        match self {
            InitProcess::InitiatedHere { process, .. } => proc_start_time(process.pid()),
            InitProcess::AdoptedFromDisk { start_time, .. } => Ok(*start_time),
        }
    }

    /// std{in,out,err} paths at init time.
    pub fn external_descriptors(&self) -> &[String] {
        match self {
            InitProcess::InitiatedHere { fds, .. } |
            InitProcess::AdoptedFromDisk { fds, .. } => fds,
        }
    }

    /// Signals the process; `None` probes for liveness without delivering
    /// anything, the kill(2) null-signal convention.
    pub fn signal(&self, sig: impl Into<Option<Signal>>) -> Result<()> {
        signal::kill(Pid::from_raw(self.pid()), sig)
            .with_context(|| format!("Failed to signal pid={}", self.pid()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn adopted_exposes_recorded_identity() -> Result<()> {
        let init = InitProcess::AdoptedFromDisk {
            pid: 4242,
            start_time: 1234567,
            fds: vec!["/dev/null".to_owned()],
        };

        assert_eq!(init.pid(), 4242);
        assert_eq!(init.start_time()?, 1234567);
        assert_eq!(init.external_descriptors(), ["/dev/null"]);
        Ok(())
    }

    #[test]
    fn null_signal_probes_liveness() -> Result<()> {
        let this_process = InitProcess::AdoptedFromDisk {
            pid: std::process::id() as i32,
            start_time: 0,
            fds: Vec::new(),
        };
        this_process.signal(None)?;

        let long_gone = InitProcess::AdoptedFromDisk {
            pid: i32::MAX - 1,
            start_time: 0,
            fds: Vec::new(),
        };
        assert!(long_gone.signal(None).is_err());
        Ok(())
    }
}
