use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::allocator;
use crate::auth;
use crate::descriptor::DescriptorStore;
use crate::runtime::ContainerRuntime;
use crate::shared::error::{Result, SandboxError};
use crate::shared::models::{
    ContainerConfig, HealthReport, ProcessStatus, Session, SessionCredentials, SessionDescriptor,
    TtlStatus,
};
use crate::shared::SandboxConfig;

/// Ports and subnets already claimed, seeded from descriptors and the
/// runtime's networks. Provisioning a batch threads one state through so
/// sessions in the same run never collide with each other.
#[derive(Debug, Default)]
pub struct AllocationState {
    pub reserved_ports: HashSet<u16>,
    pub used_subnets: HashSet<String>,
}

/// One freshly provisioned session: the durable descriptor plus the
/// plaintext credentials, which exist only in this value.
pub struct ProvisionedSession {
    pub descriptor: SessionDescriptor,
    pub credentials: SessionCredentials,
}

/// Which runtime process to pull logs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Backend,
    Frontend,
    Both,
}

/// Drives the lifecycle of session runtimes: provisioning, start/stop,
/// TTL extension, health and log retrieval. All container interaction goes
/// through the [`ContainerRuntime`] capability.
pub struct SessionOrchestrator {
    config: SandboxConfig,
    descriptors: DescriptorStore,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SessionOrchestrator {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let descriptors = DescriptorStore::new(config.sessions_dir.clone());
        Self {
            config,
            descriptors,
            runtime,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &DescriptorStore {
        &self.descriptors
    }

    /// Seed an allocation state from every known descriptor plus the
    /// runtime's live networks. A runtime listing failure degrades to
    /// descriptor knowledge only; a stale claim here surfaces later as a
    /// retryable conflict at startup, not silent reuse.
    pub async fn allocation_state(&self) -> Result<AllocationState> {
        let mut state = AllocationState::default();
        for descriptor in self.descriptors.list()? {
            state
                .reserved_ports
                .insert(descriptor.container_config.backend_port);
            state
                .reserved_ports
                .insert(descriptor.container_config.frontend_port);
            state
                .used_subnets
                .insert(descriptor.container_config.subnet.clone());
        }
        match self.runtime.network_subnets().await {
            Ok(subnets) => state.used_subnets.extend(subnets),
            Err(e) => warn!("Could not list runtime networks: {}", e),
        }
        Ok(state)
    }

    /// Provision one session end to end: credentials, port pair, subnet,
    /// descriptor and environment file, then the runtime pair. On a startup
    /// failure the descriptor directory is removed again so nothing durable
    /// points at a runtime that never came up.
    pub async fn provision_one(&self, state: &mut AllocationState) -> Result<ProvisionedSession> {
        let username = auth::generate_username();
        let password = auth::generate_password();
        let password_hash = auth::hash_password(&password)?;
        let secret_key = auth::generate_secret_key();
        let session_id = auth::generate_session_id();

        let backend_port =
            allocator::find_free_ports(self.config.base_backend_port, 1, &state.reserved_ports)?[0];
        state.reserved_ports.insert(backend_port);
        let frontend_port =
            allocator::find_free_ports(self.config.base_frontend_port, 1, &state.reserved_ports)?
                [0];
        state.reserved_ports.insert(frontend_port);
        let subnet = allocator::find_free_subnet(&state.used_subnets)?;
        state.used_subnets.insert(subnet.clone());

        let created_at = Utc::now();
        let expires_at = created_at + Duration::hours(self.config.ttl_hours);
        let descriptor = SessionDescriptor {
            session: Session {
                session_id: session_id.clone(),
                username: username.clone(),
                password_hash,
                created_at,
                expires_at,
                ttl_hours: self.config.ttl_hours,
                active: true,
                documents: Vec::new(),
                conversations: Vec::new(),
            },
            container_config: ContainerConfig {
                backend_port,
                frontend_port,
                subnet,
                container_name: self.config.container_name(&session_id),
            },
        };

        self.descriptors.save(&descriptor)?;
        self.descriptors.write_env(&descriptor, &secret_key)?;

        info!(
            "Provisioned session {} ({}): ports {}/{}, subnet {}",
            session_id,
            username,
            backend_port,
            frontend_port,
            descriptor.container_config.subnet
        );

        if let Err(e) = self
            .runtime
            .compose_up(
                &self.config.compose_file,
                &self.descriptors.env_path(&session_id),
            )
            .await
        {
            warn!("Startup failed for session {}: {}", session_id, e);
            if let Err(del) = self.descriptors.delete(&session_id) {
                warn!(
                    "Could not remove descriptor for failed session {}: {}",
                    session_id, del
                );
            }
            return Err(e);
        }

        Ok(ProvisionedSession {
            credentials: SessionCredentials {
                username,
                password,
                session_id,
                expires_at,
            },
            descriptor,
        })
    }

    /// Bring an existing session's runtime pair up. Expired sessions are
    /// refused; extend the TTL first.
    pub async fn start(&self, session_id: &str) -> Result<()> {
        let descriptor = self.descriptors.load(session_id)?;
        if descriptor.is_expired(Utc::now()) {
            return Err(SandboxError::Expired(session_id.to_string()));
        }

        let env_path = self.descriptors.env_path(session_id);
        if !env_path.is_file() {
            return Err(SandboxError::Orchestration(format!(
                "environment file missing for session {session_id}; re-provision it"
            )));
        }

        self.runtime
            .compose_up(&self.config.compose_file, &env_path)
            .await?;
        info!("Started session {}", session_id);
        Ok(())
    }

    /// Take a session's runtime pair down. Without an environment file the
    /// orchestration command cannot resolve the project, so fall back to
    /// stopping the containers individually.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let descriptor = self.descriptors.load(session_id)?;
        let env_path = self.descriptors.env_path(session_id);

        if env_path.is_file() {
            self.runtime
                .compose_down(&self.config.compose_file, &env_path)
                .await?;
        } else {
            warn!(
                "Environment file missing for session {}, stopping containers directly",
                session_id
            );
            let container = &descriptor.container_config;
            for name in [container.backend_container(), container.frontend_container()] {
                if self.runtime.container_status(&name).await != ProcessStatus::NotFound {
                    self.runtime.stop_container(&name).await?;
                }
            }
        }

        info!("Stopped session {}", session_id);
        Ok(())
    }

    /// Stop, settle, start. A stop failure aborts before the start attempt.
    pub async fn restart(&self, session_id: &str) -> Result<()> {
        self.stop(session_id).await?;
        tokio::time::sleep(StdDuration::from_secs(2)).await;
        self.start(session_id).await
    }

    /// Extend the session's lifetime by `hours` past its current expiry.
    /// Extensions are additive and apply even to an already-expired
    /// descriptor, which revives it for the remaining window.
    pub fn extend_ttl(&self, session_id: &str, hours: i64) -> Result<SessionDescriptor> {
        let mut descriptor = self.descriptors.load(session_id)?;
        descriptor.session.expires_at = descriptor.session.expires_at + Duration::hours(hours);
        descriptor.session.ttl_hours += hours;
        self.descriptors.save(&descriptor)?;
        info!(
            "Extended session {} by {}h, now expires {}",
            session_id, hours, descriptor.session.expires_at
        );
        Ok(descriptor)
    }

    /// Issue a bearer token bound to an existing session, signed with the
    /// configured secret and expiring together with the session. Expired
    /// sessions are refused, same as any other access.
    pub fn issue_token(&self, session_id: &str) -> Result<String> {
        let descriptor = self.descriptors.load(session_id)?;
        if descriptor.is_expired(Utc::now()) {
            return Err(SandboxError::Expired(session_id.to_string()));
        }
        auth::issue_session_token(
            &descriptor.session.username,
            session_id,
            &self.config.jwt_secret,
            descriptor.session.expires_at,
        )
    }

    /// Health of one session: process status per container, an HTTP
    /// reachability probe when the backend runs, and the TTL verdict. The
    /// TTL verdict is computed from the descriptor alone, so a stopped
    /// session still reports its remaining time.
    pub async fn health(&self, session_id: &str) -> Result<HealthReport> {
        let descriptor = self.descriptors.load(session_id)?;
        let container = &descriptor.container_config;

        let backend = self
            .runtime
            .container_status(&container.backend_container())
            .await;
        let frontend = self
            .runtime
            .container_status(&container.frontend_container())
            .await;

        let backend_reachable = if backend == ProcessStatus::Running {
            Some(self.probe_backend(container.backend_port).await)
        } else {
            None
        };

        let now = Utc::now();
        let ttl = if descriptor.is_expired(now) {
            TtlStatus::Expired
        } else {
            TtlStatus::Remaining(descriptor.session.time_remaining(now))
        };

        Ok(HealthReport {
            session_id: session_id.to_string(),
            backend,
            frontend,
            backend_reachable,
            ttl,
            backend_port: container.backend_port,
            frontend_port: container.frontend_port,
        })
    }

    /// An unreachable backend is a health status, never an error.
    async fn probe_backend(&self, port: u16) -> bool {
        let url = format!("http://localhost:{port}/health");
        let client = match reqwest::Client::builder()
            .timeout(StdDuration::from_secs(self.config.health_timeout_secs))
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Recent log output per selected process, as (container, text) pairs.
    pub async fn logs(
        &self,
        session_id: &str,
        target: LogTarget,
        tail: u32,
    ) -> Result<Vec<(String, String)>> {
        let descriptor = self.descriptors.load(session_id)?;
        let container = &descriptor.container_config;

        let mut names = Vec::new();
        if matches!(target, LogTarget::Backend | LogTarget::Both) {
            names.push(container.backend_container());
        }
        if matches!(target, LogTarget::Frontend | LogTarget::Both) {
            names.push(container.frontend_container());
        }

        let mut output = Vec::new();
        for name in names {
            let text = self.runtime.container_logs(&name, tail).await?;
            output.push((name, text));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::RecordingRuntime;
    use crate::shared::models::Session;

    fn test_config(sessions_dir: &std::path::Path) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.sessions_dir = sessions_dir.to_path_buf();
        config.ttl_hours = 72;
        config
    }

    fn saved_descriptor(
        orchestrator: &SessionOrchestrator,
        session_id: &str,
        ttl_hours: i64,
    ) -> SessionDescriptor {
        let created_at = Utc::now();
        let descriptor = SessionDescriptor {
            session: Session {
                session_id: session_id.to_string(),
                username: "researcher_ab12cd34".to_string(),
                password_hash: "$2b$12$hash".to_string(),
                created_at,
                expires_at: created_at + Duration::hours(ttl_hours),
                ttl_hours,
                active: true,
                documents: vec![],
                conversations: vec![],
            },
            container_config: ContainerConfig {
                backend_port: 8101,
                frontend_port: 3101,
                subnet: "10.150.7.0/24".to_string(),
                container_name: format!("resbx_{session_id}"),
            },
        };
        orchestrator.descriptors.save(&descriptor).expect("save");
        descriptor
    }

    #[tokio::test]
    async fn stop_without_env_file_stops_containers_directly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        runtime.set_status("resbx_sess-a_backend", ProcessStatus::Running);
        runtime.set_status("resbx_sess-a_frontend", ProcessStatus::Running);

        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime.clone());
        saved_descriptor(&orchestrator, "sess-a", 72);

        orchestrator.stop("sess-a").await.expect("stop");

        let calls = runtime.calls();
        assert!(calls.contains(&"stop resbx_sess-a_backend".to_string()));
        assert!(calls.contains(&"stop resbx_sess-a_frontend".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("compose_down")));
    }

    #[tokio::test]
    async fn start_refuses_expired_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime.clone());

        let mut descriptor = saved_descriptor(&orchestrator, "sess-b", 72);
        descriptor.session.expires_at = Utc::now() - Duration::hours(1);
        orchestrator.descriptors.save(&descriptor).expect("save");

        assert!(matches!(
            orchestrator.start("sess-b").await,
            Err(SandboxError::Expired(_))
        ));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn extend_ttl_is_additive_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime);

        let before = saved_descriptor(&orchestrator, "sess-c", 72);
        let extended = orchestrator.extend_ttl("sess-c", 24).expect("extend");

        assert_eq!(extended.session.ttl_hours, 96);
        assert_eq!(
            extended.session.expires_at,
            before.session.expires_at + Duration::hours(24)
        );

        let reloaded = orchestrator.descriptors.load("sess-c").expect("reload");
        assert_eq!(reloaded.session.expires_at, extended.session.expires_at);
    }

    #[tokio::test]
    async fn health_reports_missing_processes_without_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime);
        saved_descriptor(&orchestrator, "sess-d", 72);

        let report = orchestrator.health("sess-d").await.expect("health");
        assert_eq!(report.backend, ProcessStatus::NotFound);
        assert_eq!(report.frontend, ProcessStatus::NotFound);
        assert_eq!(report.backend_reachable, None);
        // TTL stays meaningful even with nothing running.
        assert!(matches!(report.ttl, TtlStatus::Remaining(_)));
    }

    #[tokio::test]
    async fn issued_token_verifies_against_configured_secret() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime);
        let descriptor = saved_descriptor(&orchestrator, "sess-f", 72);

        let token = orchestrator.issue_token("sess-f").expect("token");
        let claims = auth::verify_session_token(&token, &orchestrator.config().jwt_secret)
            .expect("verify");
        assert_eq!(claims.sub, "researcher_ab12cd34");
        assert_eq!(claims.session_id, "sess-f");
        assert_eq!(
            claims.exp as i64,
            descriptor.session.expires_at.timestamp()
        );

        let mut expired = descriptor;
        expired.session.expires_at = Utc::now() - Duration::hours(1);
        orchestrator.descriptors().save(&expired).expect("save");
        assert!(matches!(
            orchestrator.issue_token("sess-f"),
            Err(SandboxError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn logs_target_selects_containers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let orchestrator = SessionOrchestrator::new(test_config(dir.path()), runtime);
        saved_descriptor(&orchestrator, "sess-e", 72);

        let backend_only = orchestrator
            .logs("sess-e", LogTarget::Backend, 50)
            .await
            .expect("logs");
        assert_eq!(backend_only.len(), 1);
        assert_eq!(backend_only[0].0, "resbx_sess-e_backend");

        let both = orchestrator
            .logs("sess-e", LogTarget::Both, 50)
            .await
            .expect("logs");
        assert_eq!(both.len(), 2);
    }
}
