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
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};
use url::Url;
use crate::{
    archive,
    config::Config,
    consts::*,
    criu,
    dump,
    error::Error,
    process::Command,
    service,
    util::UrlExt,
};

// The daemon fronts two channels: the authoritative gRPC task service and
// the legacy line-JSON unix socket the original CLI generation spoke.
// Neither channel ever tears the process down over a failed request.

pub async fn run(config: Config) -> Result<()> {
    if env::var("CEDANA_PROFILING_ENABLED").map_or(false, |v| v == "true") {
        // The profiler ships separately; the env var only marks intent.
        info!("Profiling requested, attach an external profiler to this pid");
    }

    if env::var("CEDANA_GPU_ENABLED").map_or(false, |v| v == "true") {
        if let Err(e) = pull_gpu_binaries(&config) {
            warn!("Could not pull GPU binaries: {:#}", e);
        }
    }

    let grpc_addr: std::net::SocketAddr = GRPC_LISTEN_ADDR.parse()
        .expect("hardcoded listen address is valid");

    tokio::try_join!(
        service::serve(grpc_addr),
        serve_legacy_socket(),
    )?;

    Ok(())
}

async fn serve_legacy_socket() -> Result<()> {
    let socket_path: &Path = &*DAEMON_SOCKET_PATH;
    if socket_path.exists() {
        fs::remove_file(socket_path).map_err(|e| Error::filesystem(
            format!("Failed to remove stale {}", socket_path.display()), e))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::filesystem(
            format!("Failed to chmod {}", socket_path.display()), e))?;

    info!("Daemon socket listening on {}", socket_path.display());

    loop {
        let (stream, _addr) = listener.accept().await
            .context("Failed to accept on the daemon socket")?;

        tokio::spawn(async move {
            if let Err(e) = handle_legacy_conn(stream).await {
                error!("Daemon socket connection failed: {:#}", e);
            }
        });
    }
}

#[derive(Deserialize)]
struct LegacyRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// One JSON request per line, one JSON response per line.
async fn handle_legacy_conn(stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<LegacyRequest>(&line) {
            Ok(request) => dispatch_legacy(request).await,
            Err(e) => json!({ "error": format!("malformed request: {}", e) }),
        };

        let mut response = serde_json::to_vec(&response)?;
        response.push(b'\n');
        write_half.write_all(&response).await?;
    }

    Ok(())
}

async fn dispatch_legacy(request: LegacyRequest) -> Value {
    match request.method.as_str() {
        "CedanaDaemon.Dump" => {
            let pid = request.params["pid"].as_i64().unwrap_or(0) as i32;
            let dir = request.params["dir"].as_str().unwrap_or("").to_owned();
            if pid <= 0 || dir.is_empty() {
                return json!({ "error": "pid and dir are required" });
            }

            let result = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                let images_dir = PathBuf::from(&dir);
                let opts = criu::CriuOpts {
                    images_dir: images_dir.clone(),
                    leave_running: true,
                    ..Default::default()
                };
                dump::dump_process(pid, &opts, None)?;

                let archive_path = dump::default_archive_path(&images_dir);
                archive::compress(&images_dir, &archive_path)?;
                Ok(archive_path)
            }).await;

            match result {
                Ok(Ok(path)) => json!({ "checkpoint_path": path }),
                Ok(Err(e)) => json!({ "error": format!("{:#}", e) }),
                Err(e) => json!({ "error": format!("worker task failed: {}", e) }),
            }
        }

        "CedanaDaemon.StartNATS" => {
            // The NATS transport lives in the managed orchestrator; this
            // side only validates the identity it would run under.
            for var in ["CEDANA_CLIENT_ID", "CEDANA_JOB_ID", "CEDANA_AUTH_TOKEN"] {
                if env::var_os(var).is_none() {
                    return json!({ "error": format!("{} is not set", var) });
                }
            }
            json!({ "ok": true })
        }

        other => json!({ "error": format!("unknown method {}", other) }),
    }
}

lazy_static! {
    static ref CURL_CMD: String = env::var("CURL_CMD")
        .unwrap_or_else(|_| "curl".to_string());
}

/// Fetches the GPU helper binaries from the configured endpoint. Files
/// already on disk are left alone.
fn pull_gpu_binaries(config: &Config) -> Result<()> {
    ensure!(!config.connection.cedana_url.is_empty(),
            "connection.cedana_url is not configured");

    let base = Url::parse(&format!("https://{}", config.connection.cedana_url))
        .context("connection.cedana_url is not a valid host")?
        .raw_join("checkpoint")
        .raw_join("gpu");

    let downloads: [(&str, &Path); 2] = [
        ("gpucontroller", &*GPU_CONTROLLER_PATH),
        ("libcedana", &*GPU_SHARED_LIB_PATH),
    ];

    for (binary, target) in downloads {
        if target.exists() {
            debug!("{} already present, skipping download", target.display());
            continue;
        }

        let url = base.raw_join(binary);
        debug!("Pulling {} from {}", binary, url);

        Command::new(&[&*CURL_CMD])
            .args(&["--fail", "--silent", "--show-error", "--location"])
            .arg("--header")
            .arg(format!("Authorization: Bearer {}", config.connection.cedana_auth_token))
            .arg("--output").arg(target)
            .arg(url.as_str())
            .show_cmd_on_spawn(false) // the auth header stays out of the logs
            .spawn()?
            .wait_for_success()
            .with_context(|| format!("Failed to download {}", binary))?;

        fs::set_permissions(target, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::filesystem(
                format!("Failed to chmod {}", target.display()), e))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let resp = dispatch_legacy(LegacyRequest {
            method: "CedanaDaemon.Bogus".into(),
            params: Value::Null,
        }).await;
        assert!(resp["error"].as_str().unwrap().contains("unknown method"));
    }

    #[tokio::test]
    async fn dump_requires_pid_and_dir() {
        let resp = dispatch_legacy(LegacyRequest {
            method: "CedanaDaemon.Dump".into(),
            params: json!({ "pid": 0, "dir": "" }),
        }).await;
        assert!(resp["error"].as_str().is_some());
    }
}
