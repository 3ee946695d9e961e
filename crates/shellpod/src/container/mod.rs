//! Container runtime management module.
//!
//! The backing compute resource of every session runtime is one container,
//! managed through the Docker or Podman CLI. The runtime is auto-detected or
//! can be configured explicitly.

mod config;
mod error;

pub use config::{ContainerConfig, PortMapping, validate_container_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Lifecycle state reported by `inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Whether the container can serve requests.
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::str::FromStr for ContainerState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().trim_matches('"').to_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" | "stopping" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        })
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Container runtime abstraction for testability.
///
/// These are the only resource operations a session runtime issues: start,
/// status, endpoint lookup, teardown.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    /// `None` when the container does not exist.
    async fn container_state(&self, id_or_name: &str) -> ContainerResult<Option<ContainerState>>;
    /// Loopback `host:port` that `container_port` is published on.
    async fn published_endpoint(
        &self,
        id_or_name: &str,
        container_port: u16,
    ) -> ContainerResult<Option<String>>;
    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()>;
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker on macOS, Podman elsewhere.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self::with_type(RuntimeType::Docker);
            }
        }

        if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else {
            // Fall back to podman, will fail at runtime
            Self::with_type(RuntimeType::Podman)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.exec("version", &["version", "--format", "json"]).await?;
        let output = Self::require_success("version", output)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn exec(&self, command: &str, args: &[&str]) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    fn require_success(command: &str, output: Output) -> ContainerResult<Output> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        })
    }

    fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        for port in &config.ports {
            args.push("-p".to_string());
            match port.host_port {
                Some(host_port) => {
                    args.push(format!("127.0.0.1:{}:{}", host_port, port.container_port))
                }
                None => args.push(format!("127.0.0.1::{}", port.container_port)),
            }
        }

        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        let mut labels: Vec<_> = config.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let owned_args = Self::run_args(config);
        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();
        let output = Self::require_success("run", self.exec("run", &args).await?)?;

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn container_state(&self, id_or_name: &str) -> ContainerResult<Option<ContainerState>> {
        validate_container_name(id_or_name)?;

        let output = self
            .exec(
                "inspect",
                &["inspect", "--format", "{{.State.Status}}", id_or_name],
            )
            .await?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout);
        let state = status.parse().unwrap_or_default();
        Ok(Some(state))
    }

    async fn published_endpoint(
        &self,
        id_or_name: &str,
        container_port: u16,
    ) -> ContainerResult<Option<String>> {
        validate_container_name(id_or_name)?;

        let port = format!("{}/tcp", container_port);
        let output = self.exec("port", &["port", id_or_name, &port]).await?;
        if !output.status.success() {
            return Ok(None);
        }

        parse_port_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;

        let timeout = timeout_seconds.map(|t| t.to_string());
        let mut args = vec!["stop"];
        if let Some(ref t) = timeout {
            args.push("-t");
            args.push(t);
        }
        args.push(id_or_name);

        Self::require_success("stop", self.exec("stop", &args).await?)?;
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(id_or_name);

        let output = self.exec("rm", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone is the outcome we wanted.
            if stderr.contains("no such container") || stderr.contains("No such container") {
                return Ok(());
            }
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// First `host:port` line of `docker port` output, IPv4 preferred.
fn parse_port_output(stdout: &str) -> ContainerResult<Option<String>> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(first) = lines.next() else {
        return Ok(None);
    };
    let chosen = if first.starts_with('[') {
        lines.find(|l| !l.starts_with('[')).unwrap_or(first)
    } else {
        first
    };

    let valid_port = chosen
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if !valid_port {
        return Err(ContainerError::ParseError(format!(
            "unexpected port mapping '{}'",
            chosen
        )));
    }

    Ok(Some(chosen.replace("0.0.0.0:", "127.0.0.1:")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing_covers_docker_and_podman_words() {
        assert_eq!("running\n".parse::<ContainerState>().unwrap(), ContainerState::Running);
        assert_eq!("\"exited\"".parse::<ContainerState>().unwrap(), ContainerState::Exited);
        assert_eq!("stopped".parse::<ContainerState>().unwrap(), ContainerState::Exited);
        assert_eq!("weird".parse::<ContainerState>().unwrap(), ContainerState::Unknown);
    }

    #[test]
    fn port_output_prefers_ipv4() {
        assert_eq!(
            parse_port_output("[::1]:49153\n127.0.0.1:49153\n").unwrap(),
            Some("127.0.0.1:49153".to_string())
        );
        assert_eq!(
            parse_port_output("0.0.0.0:40001\n").unwrap(),
            Some("127.0.0.1:40001".to_string())
        );
        assert_eq!(parse_port_output("\n").unwrap(), None);
        assert!(matches!(
            parse_port_output("no mapping"),
            Err(ContainerError::ParseError(_))
        ));
    }

    #[test]
    fn run_args_publish_on_loopback_and_sort_env() {
        let config = ContainerConfig::new("shell:latest")
            .name("shellpod-s1")
            .publish(8080)
            .env("B", "2")
            .env("A", "1");
        let args = ContainerRuntime::run_args(&config);
        assert_eq!(
            args,
            vec![
                "run", "-d", "--name", "shellpod-s1", "-p", "127.0.0.1::8080", "-e", "A=1", "-e",
                "B=2", "shell:latest",
            ]
        );
    }
}
