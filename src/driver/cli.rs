//! CLI-backed drivers. Docker and Podman share one implementation (their
//! command surfaces are compatible for everything this core needs);
//! Containerd and CRI-O are detected so the operator learns what is on
//! the host, but start/stop go unimplemented through them.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{container_name, ContainerDriver, DriverError, DriverStatus};
use crate::resources::Pod;

/// Driver that shells out to a docker-compatible CLI.
pub struct CliDriver {
    binary: &'static str,
    name: &'static str,
}

impl CliDriver {
    pub fn docker() -> Self {
        Self {
            binary: "docker",
            name: "Docker",
        }
    }

    pub fn podman() -> Self {
        Self {
            binary: "podman",
            name: "Podman",
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, DriverError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        let output = Command::new(self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| DriverError::Io {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerDriver for CliDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self) -> bool {
        Command::new(self.binary)
            .arg("info")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn start_container(&self, pod: &Pod) -> Result<(), DriverError> {
        let name = container_name(pod)?;
        let args = run_args(pod, &name)?;

        info!(
            "starting container {} via {}: {} {}",
            name,
            self.name,
            self.binary,
            args.join(" ")
        );
        let container_id = self.run(&args).await?;
        info!("container {} started: {}", name, container_id);
        Ok(())
    }

    async fn stop_container(&self, pod: &Pod) -> Result<(), DriverError> {
        let name = container_name(pod)?;
        info!("stopping container {} via {}", name, self.name);

        // Both steps tolerate the container already being gone.
        if let Err(e) = self.run(&["stop".to_string(), name.clone()]).await {
            warn!("stop of {} failed (may already be stopped): {}", name, e);
        }
        if let Err(e) = self.run(&["rm".to_string(), name.clone()]).await {
            warn!("removal of {} failed (may already be removed): {}", name, e);
        }
        Ok(())
    }

    async fn container_status(&self, pod: &Pod) -> Result<DriverStatus, DriverError> {
        let name = container_name(pod)?;
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name=^{}$", name),
            "--format".to_string(),
            "{{.Status}}".to_string(),
        ];

        let status_line = match self.run(&args).await {
            Ok(line) => line,
            Err(_) => {
                return Ok(DriverStatus {
                    running: false,
                    status: "Unknown".to_string(),
                    message: String::new(),
                })
            }
        };

        Ok(DriverStatus {
            running: status_line.starts_with("Up"),
            status: status_line.clone(),
            message: status_line,
        })
    }
}

/// Argument vector for `<engine> run`, passing through env, ports, image,
/// command and args from the pod's first container.
pub fn run_args(pod: &Pod, container_name: &str) -> Result<Vec<String>, DriverError> {
    let container = pod
        .spec
        .containers
        .first()
        .ok_or_else(|| DriverError::NoContainers(pod.metadata.name.clone()))?;
    if container.image.is_empty() {
        return Err(DriverError::MissingImage(pod.metadata.name.clone()));
    }

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    for env in &container.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", env.name, env.value));
    }

    for port in &container.ports {
        args.push("-p".to_string());
        if port.host_port != 0 {
            args.push(format!("{}:{}", port.host_port, port.container_port));
        } else {
            args.push(format!("{}", port.container_port));
        }
    }

    args.push(container.image.clone());
    args.extend(container.command.iter().cloned());
    args.extend(container.args.iter().cloned());

    Ok(args)
}

/// Engine that can be detected but not driven: the operator sees it in
/// the logs, the runtime controller refuses to use it.
pub struct ProbeDriver {
    probe_binary: &'static str,
    name: &'static str,
}

impl ProbeDriver {
    pub fn containerd() -> Self {
        Self {
            probe_binary: "ctr",
            name: "Containerd",
        }
    }

    pub fn crio() -> Self {
        Self {
            probe_binary: "crictl",
            name: "CRI-O",
        }
    }

    fn unsupported(&self, operation: &'static str) -> DriverError {
        DriverError::Unsupported {
            driver: self.name,
            operation,
        }
    }
}

#[async_trait]
impl ContainerDriver for ProbeDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self) -> bool {
        Command::new(self.probe_binary)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn start_container(&self, _pod: &Pod) -> Result<(), DriverError> {
        Err(self.unsupported("start"))
    }

    async fn stop_container(&self, _pod: &Pod) -> Result<(), DriverError> {
        Err(self.unsupported("stop"))
    }

    async fn container_status(&self, _pod: &Pod) -> Result<DriverStatus, DriverError> {
        Err(self.unsupported("status"))
    }
}
