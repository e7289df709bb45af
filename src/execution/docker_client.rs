//! Docker API wrapper using the bollard crate.
//!
//! Implements [`ContainerRuntime`] against the local Docker daemon.

use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, TagImageOptions};
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::DockerError;
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the connection parameters
    /// cannot be resolved. Reachability is checked separately with `ping`.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Splits `name:tag` into repository and tag, ignoring registry ports.
fn split_image_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Builds an in-memory tar archive holding a single file.
fn single_file_tar(file_name: &str, contents: &[u8]) -> Result<Vec<u8>, DockerError> {
    let mut archive = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut archive);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, contents)?;
        builder.finish()?;
    }
    Ok(archive)
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(DockerError::RunFailed(format!(
                "Failed to inspect image {image}: {e}"
            ))),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    let lower = message.to_lowercase();
                    if is_not_found(&e)
                        || lower.contains("manifest unknown")
                        || lower.contains("not found")
                        || lower.contains("pull access denied")
                    {
                        return Err(DockerError::ImageNotFound {
                            image: image.to_string(),
                        });
                    }
                    return Err(DockerError::PullFailed {
                        image: image.to_string(),
                        reason: message,
                    });
                }
            }
        }

        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), DockerError> {
        let (repo, tag) = split_image_reference(target);
        let options = TagImageOptions { repo, tag };

        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to tag {source} as {target}: {e}")))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let device_requests = spec.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            memory: spec.limits.memory_bytes(),
            cpu_period: spec.limits.cpu_quota().map(|_| spec.limits.cpu_period()),
            cpu_quota: spec.limits.cpu_quota(),
            pids_limit: spec.limits.pids_limit(),
            network_mode: Some(spec.network_mode.clone()),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            device_requests,
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ImageNotFound {
                        image: spec.image.clone(),
                    }
                } else {
                    DockerError::RunFailed(format!("Failed to create container: {e}"))
                }
            })?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, DockerError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            env: (!env.is_empty()).then_some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self.docker.create_exec(id, exec_options).await.map_err(|e| {
            if is_not_found(&e) {
                DockerError::ContainerNotFound { id: id.to_string() }
            } else {
                DockerError::RunFailed(format!("Failed to create exec: {e}"))
            }
        })?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(DockerError::RunFailed(format!("Error reading output: {e}")));
                    }
                }
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecOutput {
            exit_code: exec_info.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn upload_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), DockerError> {
        let target = Path::new(path);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DockerError::CopyFailed(format!("no file name in path {path}")))?;
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());

        let archive = single_file_tar(&file_name, contents)?;

        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| DockerError::CopyFailed(format!("{path}: {e}")))
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(DockerError::RunFailed(format!(
                "Failed to remove container: {e}"
            ))),
        }
    }

    async fn container_exists(&self, id: &str) -> Result<bool, DockerError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(DockerError::RunFailed(format!(
                "Failed to inspect container: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_reference() {
        assert_eq!(
            split_image_reference("featbench_owner_repo:123"),
            ("featbench_owner_repo", "123")
        );
        assert_eq!(split_image_reference("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image_reference("localhost:5000/featbench_x"),
            ("localhost:5000/featbench_x", "latest")
        );
        assert_eq!(
            split_image_reference("localhost:5000/featbench_x:7"),
            ("localhost:5000/featbench_x", "7")
        );
    }

    #[test]
    fn test_single_file_tar() {
        let archive = single_file_tar("candidate.diff", b"diff --git a/x b/x\n").unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let entries: Vec<_> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["candidate.diff".to_string()]);
    }

    #[tokio::test]
    #[ignore] // Requires a running Docker daemon
    async fn test_ping_local_daemon() {
        let client = DockerClient::new().unwrap();
        client.ping().await.unwrap();
    }
}
