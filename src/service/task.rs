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
    env,
    path::{Path, PathBuf},
};
use tonic::{Request, Response, Status};
use crate::{
    archive,
    consts::*,
    container::{self, init::InitProcess},
    criu::{self, CgMode},
    dump,
    process::Command,
    restore,
    runc,
};
use super::{
    gpu::GpuPeer,
    proto::task::*,
    proto::task::task_service_server::TaskService,
    status_from_error,
};

pub struct TaskServer {
    gpu: GpuPeer,
}

impl TaskServer {
    pub fn new(gpu: GpuPeer) -> Self {
        Self { gpu }
    }
}

// The orchestration core is synchronous; each handler hops onto the
// blocking pool for the duration of its CRIU session. Suspension points
// stay in the async shell: gRPC I/O here, the GPU peer call, and the
// daemon socket next door.
async fn run_blocking<T, F>(f: F) -> Result<T, Status>
    where T: Send + 'static,
          F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("worker task failed: {}", e)))?
        .map_err(|e| {
            let criu_log = e.downcast_ref::<crate::error::Error>()
                .and_then(|err| err.criu_log_path());
            if let Some(log_path) = criu_log {
                warn!("CRIU log retained at {}", log_path.display());
            }
            status_from_error(&e)
        })
}

fn gpu_enabled() -> bool {
    env::var("CEDANA_GPU_ENABLED").map_or(false, |v| v == "true")
}

fn criu_opts_from_proto(proto_opts: &CriuOpts) -> criu::CriuOpts {
    fn non_empty(s: &str) -> Option<String> {
        if s.is_empty() { None } else { Some(s.to_owned()) }
    }

    criu::CriuOpts {
        images_dir: PathBuf::from(&proto_opts.images_directory),
        work_dir: non_empty(&proto_opts.work_directory).map(PathBuf::from),
        parent_image: non_empty(&proto_opts.parent_img),
        leave_running: proto_opts.leave_running,
        tcp_established: proto_opts.tcp_established,
        ext_unix_conns: proto_opts.ext_unix_sk,
        shell_job: proto_opts.shell_job,
        file_locks: proto_opts.file_locks,
        pre_dump: proto_opts.pre_dump,
        empty_ns_mask: proto_opts.empty_ns,
        auto_dedup: proto_opts.auto_dedup,
        lazy_pages: proto_opts.lazy_pages,
        manage_cgroups_mode: CgMode::parse(&proto_opts.manage_cgroups_mode),
        lsm_profile: non_empty(&proto_opts.lsm_profile),
        lsm_mount_context: non_empty(&proto_opts.lsm_mount_context),
        ..Default::default()
    }
}

#[tonic::async_trait]
impl TaskService for TaskServer {
    async fn dump(&self, request: Request<DumpArgs>)
        -> Result<Response<DumpResp>, Status>
    {
        let args = request.into_inner();
        if args.pid <= 0 {
            return Err(Status::invalid_argument("pid must be positive"));
        }
        if args.dir.is_empty() {
            return Err(Status::invalid_argument("no dump directory specified"));
        }

        // GPU state is captured by the peer before the process freezes.
        if gpu_enabled() {
            self.gpu.checkpoint(args.dir.clone(), args.pid).await?;
        }

        let checkpoint_path = run_blocking(move || {
            let images_dir = PathBuf::from(&args.dir);
            let opts = criu::CriuOpts {
                images_dir: images_dir.clone(),
                leave_running: true,
                ..Default::default()
            };
            dump::dump_process(args.pid, &opts, None)?;

            let archive_path = dump::default_archive_path(&images_dir);
            archive::compress(&images_dir, &archive_path)?;
            Ok(archive_path)
        }).await?;

        Ok(Response::new(DumpResp {
            success: true,
            message: format!("checkpoint written to {}", checkpoint_path.display()),
            checkpoint_path: checkpoint_path.to_string_lossy().into_owned(),
        }))
    }

    async fn restore(&self, request: Request<RestoreArgs>)
        -> Result<Response<RestoreResp>, Status>
    {
        let args = request.into_inner();
        if args.checkpoint_path.is_empty() {
            return Err(Status::invalid_argument("no checkpoint path specified"));
        }

        let restored_pid = run_blocking(move || {
            restore::restore_path(Path::new(&args.checkpoint_path),
                                  &criu::CriuOpts::default(), None)
        }).await?;

        Ok(Response::new(RestoreResp {
            success: true,
            message: format!("restored process {}", restored_pid),
            restored_pid,
        }))
    }

    async fn container_dump(&self, request: Request<ContainerDumpArgs>)
        -> Result<Response<ContainerDumpResp>, Status>
    {
        let args = request.into_inner();
        if args.container_id.is_empty() || args.checkpoint_path.is_empty() {
            return Err(Status::invalid_argument("container id and checkpoint path are required"));
        }

        let checkpoint_path = run_blocking(move || {
            let desc = container::from_docker(&args.container_id)?;
            let opts = criu::CriuOpts {
                images_dir: PathBuf::from(&args.checkpoint_path),
                leave_running: true,
                ..Default::default()
            };
            dump::dump_container(&desc, &opts, None)?;
            Ok(args.checkpoint_path)
        }).await?;

        Ok(Response::new(ContainerDumpResp {
            success: true,
            message: format!("checkpoint written to {}", checkpoint_path),
            checkpoint_path,
        }))
    }

    async fn container_restore(&self, request: Request<ContainerRestoreArgs>)
        -> Result<Response<ContainerRestoreResp>, Status>
    {
        let args = request.into_inner();
        if args.container_id.is_empty() || args.checkpoint_path.is_empty() {
            return Err(Status::invalid_argument("container id and checkpoint path are required"));
        }

        let restored_pid = run_blocking(move || {
            let desc = container::from_docker(&args.container_id)?;
            let _guard = desc.try_lock()?;

            // An init whose std{in,out,err} sat on a pty slave can only
            // come back as a shell job.
            let opts = criu::CriuOpts {
                shell_job: desc.init.external_descriptors().iter()
                    .any(|fd| fd.contains("pts/")),
                ..Default::default()
            };
            restore::restore_path(Path::new(&args.checkpoint_path), &opts, None)
        }).await?;

        Ok(Response::new(ContainerRestoreResp {
            success: true,
            message: format!("restored process {}", restored_pid),
        }))
    }

    async fn runc_dump(&self, request: Request<RuncDumpArgs>)
        -> Result<Response<RuncDumpResp>, Status>
    {
        let args = request.into_inner();
        if args.container_id.is_empty() {
            return Err(Status::invalid_argument("container id is required"));
        }
        let opts = args.criu_opts.as_ref()
            .map(criu_opts_from_proto)
            .ok_or_else(|| Status::invalid_argument("criu opts are required"))?;
        if opts.images_dir.as_os_str().is_empty() {
            return Err(Status::invalid_argument("images directory is required"));
        }

        let message = run_blocking(move || {
            let root = if args.root.is_empty() { None } else { Some(Path::new(&args.root)) };
            let desc = container::from_runc(&args.container_id, root)?;

            dump::dump_container(&desc, &opts, None)?;

            if !args.checkpoint_path.is_empty() {
                archive::compress(&opts.images_dir, Path::new(&args.checkpoint_path))?;
                Ok(format!("checkpoint written to {}", args.checkpoint_path))
            } else {
                Ok(format!("checkpoint written to {}", opts.images_dir.display()))
            }
        }).await?;

        Ok(Response::new(RuncDumpResp { success: true, message }))
    }

    async fn runc_restore(&self, request: Request<RuncRestoreArgs>)
        -> Result<Response<RuncRestoreResp>, Status>
    {
        let args = request.into_inner();
        if args.container_id.is_empty() || args.image_path.is_empty() {
            return Err(Status::invalid_argument("container id and image path are required"));
        }

        let message = run_blocking(move || {
            let opts = args.opts.map(|o| runc::RuncOpts {
                root: o.root,
                bundle: o.bundle,
                console_socket: o.console_socket,
                detach: o.detach,
                net_pid: o.net_pid,
            }).unwrap_or_default();

            runc::restore_container(&args.image_path, &args.container_id,
                                    &opts, args.is_k3s)?;
            Ok(format!("restored container {}", args.container_id))
        }).await?;

        Ok(Response::new(RuncRestoreResp { success: true, message }))
    }

    async fn start_task(&self, request: Request<StartTaskArgs>)
        -> Result<Response<StartTaskResp>, Status>
    {
        let args = request.into_inner();
        let argv: Vec<String> = args.task.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            return Err(Status::invalid_argument("no task command given"));
        }

        let pid = run_blocking(move || {
            let mut cmd = Command::new(&argv);
            if !args.working_dir.is_empty() {
                cmd.current_dir(&args.working_dir);
            }

            let init = InitProcess::InitiatedHere {
                process: cmd.spawn()?,
                fds: Vec::new(),
            };
            let pid = init.pid();
            // The start time lets a later dump tell this pid from a reused one.
            debug!("Started task pid {} start_time {}", pid, init.start_time()?);

            // Reap in the background so the task doesn't linger as a zombie.
            std::thread::spawn(move || {
                if let InitProcess::InitiatedHere { mut process, .. } = init {
                    let _ = process.wait();
                }
            });

            Ok(pid)
        }).await?;

        Ok(Response::new(StartTaskResp {
            success: true,
            message: format!("started task with pid {}", pid),
            pid,
        }))
    }

    async fn get_runc_id_by_name(&self, request: Request<CtrByNameArgs>)
        -> Result<Response<CtrByNameResp>, Status>
    {
        let args = request.into_inner();
        if args.container_name.is_empty() {
            return Err(Status::invalid_argument("container name is required"));
        }

        let container_name = args.container_name.clone();
        let id = run_blocking(move || {
            let root = if args.root.is_empty() { RUNC_ROOT } else { args.root.as_str() };
            runc::get_id_by_name(Path::new(root), &args.container_name)
        }).await?;

        match id {
            Some(runc_container_id) => Ok(Response::new(CtrByNameResp { runc_container_id })),
            None => Err(Status::not_found(
                format!("no container named {} found", container_name))),
        }
    }
}
