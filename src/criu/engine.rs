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
    io::{ErrorKind, IoSliceMut},
    os::unix::io::RawFd,
    path::PathBuf,
    time::Instant,
};
use nix::{
    errno::Errno,
    sys::signal::Signal,
    sys::socket::{
        recvmsg, send, setsockopt, shutdown, socketpair, sockopt::ReceiveTimeout,
        AddressFamily, MsgFlags, Shutdown, SockFlag, SockType,
    },
    sys::time::{TimeVal, TimeValLike},
    unistd::close,
};
use prost::Message;
use crate::{
    consts::*,
    container::cgroup::CgroupManager,
    error::Error,
    process::{format_exit_status, Command, Process},
    util::retry_on_interrupt,
};
use super::rpc;

// A request/response session with `criu swrk 3`. Fd 3 of the child is one
// end of a SOCK_SEQPACKET pair; each protobuf message is one datagram.
// The session is terminal after a single successful exchange, any
// transport error, or a negative CriuResp.

pub struct SwrkSession {
    sock: RawFd,
    sock_closed: bool,
    criu: Option<Process>,
    log_path: PathBuf,
    deadline: Option<Instant>,
}

impl SwrkSession {
    /// Spawns `criu swrk` wired to a fresh socketpair. `extra_fds` land in
    /// the child right after the RPC socket, at fd 4 onwards. When a cgroup
    /// manager is given, the CRIU child joins the container's cgroup so it
    /// shares the freezer.
    pub fn spawn(
        cgroup: Option<&dyn CgroupManager>,
        extra_fds: &[RawFd],
        log_path: Option<PathBuf>,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        let (client, server) = socketpair(
            AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::SOCK_CLOEXEC)
            .context("Failed to create a socketpair for CRIU")?;

        // Sources never collide with the 3+i targets: the daemon keeps
        // std{in,out,err} open, so freshly created fds are all >= 3 in order.
        let mut inherited = vec![server];
        inherited.extend_from_slice(extra_fds);

        let spawn_result = Command::new(&["criu", "swrk", "3"])
            .inherited_fds(&inherited)
            .spawn();

        // The child owns its copy now (or never will). With our server end
        // closed, reads fail fast if CRIU exits unexpectedly.
        let _ = close(server);

        let criu = match spawn_result {
            Ok(p) => p,
            Err(e) => {
                let _ = close(client);
                let not_found = e.downcast_ref::<std::io::Error>()
                    .map_or(false, |io_err| io_err.kind() == ErrorKind::NotFound);
                return Err(if not_found {
                    Error::PreconditionMissing(
                        "criu binary not found, is CRIU installed?".to_owned()).into()
                } else {
                    e
                });
            }
        };

        let session = Self {
            sock: client,
            sock_closed: false,
            criu: Some(criu),
            log_path: log_path.unwrap_or_default(),
            deadline,
        };

        if let Some(cgroup) = cgroup {
            // No-op when the container has no resolvable cgroup paths.
            cgroup.apply(session.criu_pid())
                .context("Failed to place the CRIU process in the container cgroup")?;
        }

        Ok(session)
    }

    pub fn criu_pid(&self) -> i32 {
        // unwrap() is safe: criu is only taken in exchange(), which consumes self.
        self.criu.as_ref().unwrap().pid()
    }

    /// Runs one request to completion and reaps the CRIU child. Consumes
    /// the session: swrk answers exactly one request per worker, barring
    /// notifications.
    pub fn exchange(mut self, mut req: rpc::CriuReq) -> Result<rpc::CriuResp> {
        let req_type = rpc::CriuReqType::try_from(req.r#type)
            .unwrap_or(rpc::CriuReqType::Empty);

        self.send_req(&req)?;

        let mut buf = vec![0u8; RPC_FRAME_SIZE];
        let resp = loop {
            let n = self.recv_frame(&mut buf)?;

            // CRIU reopens the status fd before its first answer. Leaving
            // ours open would leak it, and whoever polls it would wait
            // forever.
            if let Some(opts) = req.opts.as_mut() {
                if let Some(fd) = opts.status_fd.take() {
                    let _ = close(fd);
                }
            }

            if n == 0 {
                return Err(Error::UnexpectedEof.into());
            }
            if n == buf.len() {
                return Err(Error::FrameTooLarge { limit: buf.len() }.into());
            }

            let resp = rpc::CriuResp::decode(&buf[..n])
                .context("Failed to decode CRIU response")?;

            if !resp.success {
                return Err(Error::CriuError {
                    req_type: req_type.as_str_name().to_owned(),
                    errno: resp.cr_errno,
                    log_path: self.log_path.clone(),
                }.into());
            }

            match rpc::CriuReqType::try_from(resp.r#type) {
                Ok(rpc::CriuReqType::Notify) => {
                    // Notify scripts are disabled; consume and move on.
                    trace!("CRIU notification: {:?}",
                           resp.notify.as_ref().and_then(|n| n.script.as_deref()));
                    continue;
                }
                Ok(t) if t == req_type => break resp,
                Ok(t) => return Err(Error::UnexpectedRespType {
                    resp_type: t.as_str_name().to_owned(),
                }.into()),
                Err(_) => return Err(Error::UnexpectedRespType {
                    resp_type: format!("{}", resp.r#type),
                }.into()),
            }
        };

        // Half-close our side so CRIU sees EOF and wraps up.
        let _ = shutdown(self.sock, Shutdown::Write);

        let status = self.wait_criu()?;

        // In PRE_DUMP mode CRIU sits in a loop waiting for the final DUMP
        // command; the EOF makes it bail out with a non-zero status.
        if !status.success() && req_type != rpc::CriuReqType::PreDump {
            return Err(Error::CriuSubprocessFailed {
                status: format_exit_status(status),
                log_path: self.log_path.clone(),
            }.into());
        }

        Ok(resp)
    }

    fn send_req(&mut self, req: &rpc::CriuReq) -> Result<()> {
        let buf = req.encode_to_vec();
        let written = retry_on_interrupt(|| send(self.sock, &buf, MsgFlags::empty()))
            .context("Failed to write to the CRIU socket")?;
        ensure!(written == buf.len(), "Short write on the CRIU socket");
        Ok(())
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.arm_read_timeout()?;

        // The ancillary buffer receives SCM_RIGHTS control messages. We
        // currently have no response carrying fds, but the protocol allows
        // them and truncation flags would otherwise be set.
        let mut oob = Vec::with_capacity(RPC_OOB_SIZE);
        let mut iov = [IoSliceMut::new(buf)];

        let received = retry_on_interrupt(|| {
            recvmsg::<()>(self.sock, &mut iov, Some(&mut oob), MsgFlags::empty())
                .map(|msg| msg.bytes)
        });

        match received {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => self.timeout_teardown(),
            Err(e) => Err(e).context("Failed to read from the CRIU socket"),
        }
    }

    fn arm_read_timeout(&mut self) -> Result<()> {
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => return Ok(()),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return self.timeout_teardown();
        }

        // A zero timeval would disable the timeout entirely.
        let timeval = TimeVal::microseconds(
            std::cmp::max(remaining.as_micros() as i64, 1));
        setsockopt(self.sock, ReceiveTimeout, &timeval)
            .context("Failed to set the CRIU socket receive timeout")?;
        Ok(())
    }

    /// The deadline has passed: kill CRIU, close the transport, give up.
    fn timeout_teardown<T>(&mut self) -> Result<T> {
        if let Some(mut criu) = self.criu.take() {
            let _ = criu.kill(Signal::SIGKILL);
            let _ = criu.wait();
        }
        self.close_sock();
        Err(Error::Timeout.into())
    }

    fn wait_criu(&mut self) -> Result<std::process::ExitStatus> {
        // unwrap() is safe: exchange() runs at most once per session.
        let mut criu = self.criu.take().unwrap();
        match self.deadline {
            Some(deadline) => match criu.wait_timeout(deadline)? {
                Some(status) => Ok(status),
                None => {
                    let _ = criu.kill(Signal::SIGKILL);
                    let _ = criu.wait();
                    self.close_sock();
                    Err(Error::Timeout.into())
                }
            },
            None => criu.wait(),
        }
    }

    fn close_sock(&mut self) {
        if !self.sock_closed {
            let _ = close(self.sock);
            self.sock_closed = true;
        }
    }
}

impl Drop for SwrkSession {
    fn drop(&mut self) {
        self.close_sock();
        // On error paths the CRIU child may still be alive; don't leave an
        // orphan behind, and don't leave a zombie either.
        if let Some(mut criu) = self.criu.take() {
            let _ = criu.kill(Signal::SIGKILL);
            let _ = criu.wait();
        }
    }
}
