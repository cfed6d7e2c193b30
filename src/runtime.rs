use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::shared::error::{Result, SandboxError};
use crate::shared::models::{ProcessStatus, RuntimeContainer};

/// Capability interface over the external container/process manager. The
/// lifecycle logic (TTL, allocation, reconciliation) depends only on this
/// trait, so tests run against a recording fake and the production path is
/// a subprocess-invoking adapter.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Bring the session's runtime pair up with its environment file.
    async fn compose_up(&self, compose_file: &Path, env_file: &Path) -> Result<()>;

    /// Take the session's runtime pair down.
    async fn compose_down(&self, compose_file: &Path, env_file: &Path) -> Result<()>;

    async fn container_status(&self, name: &str) -> ProcessStatus;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn container_logs(&self, name: &str, tail: u32) -> Result<String>;

    /// Containers whose names contain `name_filter`.
    async fn list_containers(&self, name_filter: &str) -> Result<Vec<RuntimeContainer>>;

    /// Address blocks currently bound to runtime networks.
    async fn network_subnets(&self) -> Result<Vec<String>>;
}

/// Production adapter invoking the docker / docker-compose CLIs. Every
/// invocation waits for the subprocess to exit and surfaces captured stderr
/// on failure; callers must not hold registry locks across these awaits.
pub struct DockerCliRuntime {
    docker_bin: String,
    compose_bin: String,
}

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            compose_bin: "docker-compose".to_string(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Orchestration(format!("failed to spawn {program}: {e}")))?;
        Ok(output)
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a compose failure to the error taxonomy: bind and subnet collisions
/// are retryable ResourceConflict, everything else is OrchestrationFailure.
fn classify_compose_error(stderr: &str) -> SandboxError {
    let lowered = stderr.to_lowercase();
    let conflict = lowered.contains("port is already allocated")
        || lowered.contains("address already in use")
        || lowered.contains("pool overlaps");
    if conflict {
        SandboxError::ResourceConflict(stderr.trim().to_string())
    } else {
        SandboxError::Orchestration(stderr.trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn compose_up(&self, compose_file: &Path, env_file: &Path) -> Result<()> {
        let compose = compose_file.to_string_lossy();
        let env = env_file.to_string_lossy();
        let output = self
            .run(
                &self.compose_bin,
                &["-f", &compose, "--env-file", &env, "up", "-d"],
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_compose_error(&String::from_utf8_lossy(
                &output.stderr,
            )))
        }
    }

    async fn compose_down(&self, compose_file: &Path, env_file: &Path) -> Result<()> {
        let compose = compose_file.to_string_lossy();
        let env = env_file.to_string_lossy();
        let output = self
            .run(
                &self.compose_bin,
                &["-f", &compose, "--env-file", &env, "down"],
            )
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn container_status(&self, name: &str) -> ProcessStatus {
        let output = self
            .run(
                &self.docker_bin,
                &["inspect", "--format", "{{.State.Status}}", name],
            )
            .await;
        match output {
            Ok(output) if output.status.success() => {
                ProcessStatus::from_state(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => ProcessStatus::NotFound,
            Err(_) => ProcessStatus::Error,
        }
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let output = self.run(&self.docker_bin, &["stop", name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let output = self.run(&self.docker_bin, &["rm", "-f", name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn container_logs(&self, name: &str, tail: u32) -> Result<String> {
        let tail = tail.to_string();
        let output = self
            .run(&self.docker_bin, &["logs", "--tail", &tail, name])
            .await?;
        if output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                // Container stderr is part of its logs, not a failure.
                text.push_str(&stderr);
            }
            Ok(text)
        } else {
            Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn list_containers(&self, name_filter: &str) -> Result<Vec<RuntimeContainer>> {
        let output = self
            .run(
                &self.docker_bin,
                &[
                    "ps",
                    "--format",
                    "{{.Names}}\t{{.ID}}\t{{.Status}}\t{{.Ports}}",
                ],
            )
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 3 && parts[0].contains(name_filter) {
                containers.push(RuntimeContainer {
                    name: parts[0].to_string(),
                    id: parts[1].to_string(),
                    status: parts[2].to_string(),
                    ports: parts.get(3).unwrap_or(&"").to_string(),
                });
            }
        }
        Ok(containers)
    }

    async fn network_subnets(&self) -> Result<Vec<String>> {
        let output = self
            .run(&self.docker_bin, &["network", "ls", "--format", "{{.Name}}"])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Orchestration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut args: Vec<&str> = vec![
            "network",
            "inspect",
            "--format",
            "{{range .IPAM.Config}}{{.Subnet}}\n{{end}}",
        ];
        for name in &names {
            args.push(name);
        }

        let output = self.run(&self.docker_bin, &args).await?;
        // Inspect can fail on a network that vanished between the two
        // calls; treat whatever came back as the answer.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// In-memory runtime fake recording every invocation, shared by the
/// orchestrator and reconciler tests.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::ContainerRuntime;
    use crate::shared::error::{Result, SandboxError};
    use crate::shared::models::{ProcessStatus, RuntimeContainer};

    #[derive(Default)]
    pub struct RecordingRuntime {
        statuses: Mutex<HashMap<String, ProcessStatus>>,
        containers: Mutex<Vec<RuntimeContainer>>,
        subnets: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        compose_up_error: Mutex<Option<String>>,
    }

    impl RecordingRuntime {
        pub fn set_status(&self, name: &str, status: ProcessStatus) {
            self.statuses
                .lock()
                .expect("statuses lock")
                .insert(name.to_string(), status);
        }

        pub fn set_containers(&self, containers: Vec<RuntimeContainer>) {
            *self.containers.lock().expect("containers lock") = containers;
        }

        pub fn set_subnets(&self, subnets: Vec<String>) {
            *self.subnets.lock().expect("subnets lock") = subnets;
        }

        pub fn fail_compose_up(&self, message: &str) {
            *self.compose_up_error.lock().expect("error lock") = Some(message.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls lock").push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn compose_up(&self, _compose_file: &Path, env_file: &Path) -> Result<()> {
            self.record(format!("compose_up {}", env_file.display()));
            match self.compose_up_error.lock().expect("error lock").clone() {
                Some(message) => Err(SandboxError::Orchestration(message)),
                None => Ok(()),
            }
        }

        async fn compose_down(&self, _compose_file: &Path, env_file: &Path) -> Result<()> {
            self.record(format!("compose_down {}", env_file.display()));
            Ok(())
        }

        async fn container_status(&self, name: &str) -> ProcessStatus {
            self.statuses
                .lock()
                .expect("statuses lock")
                .get(name)
                .copied()
                .unwrap_or(ProcessStatus::NotFound)
        }

        async fn stop_container(&self, name: &str) -> Result<()> {
            self.record(format!("stop {name}"));
            Ok(())
        }

        async fn remove_container(&self, name: &str) -> Result<()> {
            self.record(format!("remove {name}"));
            Ok(())
        }

        async fn container_logs(&self, name: &str, tail: u32) -> Result<String> {
            self.record(format!("logs {name} {tail}"));
            Ok(String::new())
        }

        async fn list_containers(&self, name_filter: &str) -> Result<Vec<RuntimeContainer>> {
            Ok(self
                .containers
                .lock()
                .expect("containers lock")
                .iter()
                .filter(|c| c.name.contains(name_filter))
                .cloned()
                .collect())
        }

        async fn network_subnets(&self) -> Result<Vec<String>> {
            Ok(self.subnets.lock().expect("subnets lock").clone())
        }
    }
}
