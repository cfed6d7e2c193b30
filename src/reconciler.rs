use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::descriptor::DescriptorStore;
use crate::registry::SessionRegistry;
use crate::runtime::ContainerRuntime;
use crate::shared::error::Result;
use crate::shared::models::{
    ProcessStatus, RuntimeContainer, SessionDescriptor, SessionState,
};
use crate::shared::SandboxConfig;
use crate::store::EphemeralStore;

/// In-process background sweep: every interval, expired sessions leave the
/// registry and their ephemeral data is cascade-deleted. Session access
/// already refuses expired sessions, so the sweep only reclaims memory and
/// files; a late tick never extends a session's life.
pub struct ExpirySweeper {
    registry: Arc<SessionRegistry>,
    store: Arc<EphemeralStore>,
    interval: StdDuration,
}

impl ExpirySweeper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<EphemeralStore>,
        interval: StdDuration,
    ) -> Self {
        Self {
            registry,
            store,
            interval,
        }
    }

    /// One sweep pass. Returns the removed session ids.
    pub fn sweep_once(&self) -> Vec<String> {
        let expired = self.registry.sweep_expired();
        for session_id in &expired {
            self.store.clear_session(session_id);
            info!("Expired session {} removed with its data", session_id);
        }
        expired
    }

    /// Run the sweep loop until the token is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Expiry sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep_once();
                        if !removed.is_empty() {
                            info!("Expiry sweep removed {} session(s)", removed.len());
                        }
                    }
                }
            }
        })
    }
}

/// Result of a descriptor sweep: which sessions went away cleanly and which
/// hit an error (and were left for the next run).
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Removes sessions durably: runtime pair down, containers force-removed,
/// descriptor directory deleted. Used by the standalone cleanup tooling;
/// every step is attempted per session so one failure never strands the
/// rest of a sweep.
pub struct SessionReaper {
    config: SandboxConfig,
    descriptors: DescriptorStore,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SessionReaper {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let descriptors = DescriptorStore::new(config.sessions_dir.clone());
        Self {
            config,
            descriptors,
            runtime,
        }
    }

    pub fn descriptors(&self) -> &DescriptorStore {
        &self.descriptors
    }

    /// Tear one session down completely. Container removal is best-effort
    /// (`rm -f` also covers a running pair); only a failure to delete the
    /// descriptor directory is an error, because that is what would make
    /// the session reappear in the next listing.
    pub async fn remove_session(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let session_id = &descriptor.session.session_id;
        let container = &descriptor.container_config;

        let env_path = self.descriptors.env_path(session_id);
        if env_path.is_file() {
            if let Err(e) = self
                .runtime
                .compose_down(&self.config.compose_file, &env_path)
                .await
            {
                warn!("Compose down failed for session {}: {}", session_id, e);
            }
        }

        for name in [container.backend_container(), container.frontend_container()] {
            if self.runtime.container_status(&name).await != ProcessStatus::NotFound {
                if let Err(e) = self.runtime.remove_container(&name).await {
                    warn!("Could not remove container {}: {}", name, e);
                }
            }
        }

        self.descriptors.delete(session_id)?;
        info!("Removed session {}", session_id);
        Ok(())
    }

    pub async fn remove_by_id(&self, session_id: &str) -> Result<()> {
        let descriptor = self.descriptors.load(session_id)?;
        self.remove_session(&descriptor).await
    }

    /// Remove every session past its TTL. With `dry_run` the candidates are
    /// reported but nothing is touched.
    pub async fn sweep_expired(&self, dry_run: bool) -> Result<SweepOutcome> {
        let now = Utc::now();
        let expired: Vec<SessionDescriptor> = self
            .descriptors
            .list()?
            .into_iter()
            .filter(|d| d.is_expired(now))
            .collect();
        self.remove_batch(expired, dry_run).await
    }

    /// Remove every session, expired or not, then force-remove any leftover
    /// container carrying the session prefix (orphans included).
    pub async fn remove_all(&self, dry_run: bool) -> Result<SweepOutcome> {
        let all = self.descriptors.list()?;
        let outcome = self.remove_batch(all, dry_run).await?;
        if dry_run {
            return Ok(outcome);
        }

        let prefix = format!("{}_", self.config.container_prefix);
        match self.runtime.list_containers(&prefix).await {
            Ok(leftovers) => {
                for container in leftovers {
                    if let Err(e) = self.runtime.remove_container(&container.name).await {
                        warn!("Could not remove container {}: {}", container.name, e);
                    }
                }
            }
            Err(e) => warn!("Could not list leftover containers: {}", e),
        }
        Ok(outcome)
    }

    async fn remove_batch(
        &self,
        descriptors: Vec<SessionDescriptor>,
        dry_run: bool,
    ) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        for descriptor in descriptors {
            let session_id = descriptor.session.session_id.clone();
            if dry_run {
                info!("Would remove session {}", session_id);
                outcome.removed.push(session_id);
                continue;
            }
            match self.remove_session(&descriptor).await {
                Ok(()) => outcome.removed.push(session_id),
                Err(e) => {
                    error!("Failed to remove session {}: {}", session_id, e);
                    outcome.failed.push(session_id);
                }
            }
        }
        Ok(outcome)
    }
}

/// One listing row: the descriptor with its derived state and per-process
/// liveness.
#[derive(Debug, Clone)]
pub struct SessionOverview {
    pub descriptor: SessionDescriptor,
    pub state: SessionState,
    pub backend_running: bool,
    pub frontend_running: bool,
}

/// Snapshot for the listing tools: every known session plus containers
/// carrying the session prefix without a matching descriptor.
#[derive(Debug, Default)]
pub struct OverviewReport {
    pub sessions: Vec<SessionOverview>,
    pub orphans: Vec<RuntimeContainer>,
}

impl OverviewReport {
    pub fn count(&self, state: SessionState) -> usize {
        self.sessions.iter().filter(|s| s.state == state).count()
    }
}

/// Reconcile descriptors against the runtime's view into a read-only
/// report. Sessions closest to expiry sort first.
pub async fn build_overview(
    config: &SandboxConfig,
    descriptors: &DescriptorStore,
    runtime: &dyn ContainerRuntime,
) -> Result<OverviewReport> {
    let now = Utc::now();
    let mut report = OverviewReport::default();

    let known = descriptors.list()?;
    for descriptor in known {
        let container = &descriptor.container_config;
        let backend_running =
            runtime.container_status(&container.backend_container()).await == ProcessStatus::Running;
        let frontend_running = runtime
            .container_status(&container.frontend_container())
            .await
            == ProcessStatus::Running;
        let state = SessionState::classify(
            backend_running || frontend_running,
            descriptor.is_expired(now),
            descriptor.session.active,
        );
        report.sessions.push(SessionOverview {
            descriptor,
            state,
            backend_running,
            frontend_running,
        });
    }
    report
        .sessions
        .sort_by(|a, b| a.descriptor.session.expires_at.cmp(&b.descriptor.session.expires_at));

    let prefix = format!("{}_", config.container_prefix);
    match runtime.list_containers(&prefix).await {
        Ok(containers) => {
            report.orphans = containers
                .into_iter()
                .filter(|c| {
                    !report
                        .sessions
                        .iter()
                        .any(|s| c.name.contains(&s.descriptor.session.session_id))
                })
                .collect();
        }
        Err(e) => warn!("Could not list containers for overview: {}", e),
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::RecordingRuntime;
    use crate::shared::models::{ContainerConfig, Session};
    use chrono::Duration;

    fn test_config(sessions_dir: &std::path::Path) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.sessions_dir = sessions_dir.to_path_buf();
        config
    }

    fn descriptor(session_id: &str, hours_left: i64) -> SessionDescriptor {
        let now = Utc::now();
        SessionDescriptor {
            session: Session {
                session_id: session_id.to_string(),
                username: format!("researcher_{session_id}"),
                password_hash: "$2b$12$hash".to_string(),
                created_at: now - Duration::hours(1),
                expires_at: now + Duration::hours(hours_left),
                ttl_hours: 72,
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
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_descriptors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        runtime.set_status("resbx_sess-old_backend", ProcessStatus::Exited);
        runtime.set_status("resbx_sess-old_frontend", ProcessStatus::Exited);

        let reaper = SessionReaper::new(test_config(dir.path()), runtime.clone());
        reaper.descriptors().save(&descriptor("sess-old", -2)).expect("save");
        reaper.descriptors().save(&descriptor("sess-live", 48)).expect("save");

        let outcome = reaper.sweep_expired(false).await.expect("sweep");
        assert_eq!(outcome.removed, vec!["sess-old".to_string()]);
        assert!(outcome.failed.is_empty());
        assert!(!reaper.descriptors().exists("sess-old"));
        assert!(reaper.descriptors().exists("sess-live"));

        // Removal happened exactly once per container.
        assert_eq!(runtime.call_count("remove resbx_sess-old_backend"), 1);
        assert_eq!(runtime.call_count("remove resbx_sess-old_frontend"), 1);
        assert_eq!(runtime.call_count("remove resbx_sess-live"), 0);

        // A second sweep finds nothing left to do.
        let again = reaper.sweep_expired(false).await.expect("sweep");
        assert!(again.removed.is_empty());
        assert_eq!(runtime.call_count("remove resbx_sess-old_backend"), 1);
    }

    #[tokio::test]
    async fn sweep_takes_runtime_down_through_compose() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let reaper = SessionReaper::new(test_config(dir.path()), runtime.clone());

        let expired = descriptor("sess-done", -2);
        reaper.descriptors().save(&expired).expect("save");
        reaper
            .descriptors()
            .write_env(&expired, "deadbeef")
            .expect("env");

        let env_path = reaper.descriptors().env_path("sess-done");
        let outcome = reaper.sweep_expired(false).await.expect("sweep");

        assert_eq!(outcome.removed, vec!["sess-done".to_string()]);
        assert_eq!(
            runtime.call_count(&format!("compose_down {}", env_path.display())),
            1
        );
        assert!(!reaper.descriptors().exists("sess-done"));

        // Nothing left for a second pass to take down.
        let again = reaper.sweep_expired(false).await.expect("sweep");
        assert!(again.removed.is_empty());
        assert_eq!(runtime.call_count("compose_down"), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_anything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        let reaper = SessionReaper::new(test_config(dir.path()), runtime.clone());
        reaper.descriptors().save(&descriptor("sess-old", -2)).expect("save");

        let outcome = reaper.sweep_expired(true).await.expect("sweep");
        assert_eq!(outcome.removed, vec!["sess-old".to_string()]);
        assert!(reaper.descriptors().exists("sess-old"));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_all_clears_descriptors_and_leftover_containers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        runtime.set_containers(vec![RuntimeContainer {
            name: "resbx_orphan_backend".to_string(),
            id: "abc123".to_string(),
            status: "Up 2 hours".to_string(),
            ports: String::new(),
        }]);

        let reaper = SessionReaper::new(test_config(dir.path()), runtime.clone());
        reaper.descriptors().save(&descriptor("sess-a", 48)).expect("save");
        reaper.descriptors().save(&descriptor("sess-b", -1)).expect("save");

        let outcome = reaper.remove_all(false).await.expect("remove all");
        assert_eq!(outcome.removed.len(), 2);
        assert!(reaper.descriptors().list().expect("list").is_empty());
        assert_eq!(runtime.call_count("remove resbx_orphan_backend"), 1);
    }

    #[tokio::test]
    async fn overview_classifies_and_finds_orphans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = Arc::new(RecordingRuntime::default());
        runtime.set_status("resbx_sess-up_backend", ProcessStatus::Running);
        runtime.set_containers(vec![
            RuntimeContainer {
                name: "resbx_sess-up_backend".to_string(),
                id: "abc".to_string(),
                status: "Up 1 hour".to_string(),
                ports: "0.0.0.0:8101->8000/tcp".to_string(),
            },
            RuntimeContainer {
                name: "resbx_ghost_frontend".to_string(),
                id: "def".to_string(),
                status: "Up 9 hours".to_string(),
                ports: String::new(),
            },
        ]);

        let config = test_config(dir.path());
        let descriptors = DescriptorStore::new(config.sessions_dir.clone());
        descriptors.save(&descriptor("sess-up", 48)).expect("save");
        descriptors.save(&descriptor("sess-past", -3)).expect("save");
        let mut inactive = descriptor("sess-idle", 24);
        inactive.session.active = false;
        descriptors.save(&inactive).expect("save");

        let report = build_overview(&config, &descriptors, runtime.as_ref())
            .await
            .expect("overview");

        assert_eq!(report.sessions.len(), 3);
        let state_of = |id: &str| {
            report
                .sessions
                .iter()
                .find(|s| s.descriptor.session.session_id == id)
                .map(|s| s.state)
                .expect("session present")
        };
        assert_eq!(state_of("sess-up"), SessionState::Running);
        assert_eq!(state_of("sess-past"), SessionState::Expired);
        assert_eq!(state_of("sess-idle"), SessionState::Stopped);

        // Closest expiry sorts first.
        assert_eq!(report.sessions[0].descriptor.session.session_id, "sess-past");

        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].name, "resbx_ghost_frontend");
        assert_eq!(report.count(SessionState::Running), 1);
    }

    #[tokio::test]
    async fn in_process_sweep_clears_registry_and_store() {
        let registry = Arc::new(SessionRegistry::new(-1));
        let store = Arc::new(EphemeralStore::new());
        let session_id = registry.create("researcher_x", "hash");
        store.create_conversation(&session_id);

        let sweeper = ExpirySweeper::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            StdDuration::from_secs(60),
        );
        let removed = sweeper.sweep_once();

        assert_eq!(removed, vec![session_id.clone()]);
        assert!(registry.is_empty());
        assert!(store.list_conversations(&session_id).is_empty());
    }

    #[tokio::test]
    async fn sweeper_loop_stops_on_cancellation() {
        let registry = Arc::new(SessionRegistry::new(72));
        let store = Arc::new(EphemeralStore::new());
        let sweeper = ExpirySweeper::new(registry, store, StdDuration::from_secs(3600));

        let shutdown = CancellationToken::new();
        let handle = sweeper.spawn(shutdown.clone());
        shutdown.cancel();
        handle.await.expect("clean shutdown");
    }
}
