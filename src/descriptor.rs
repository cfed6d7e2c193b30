use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::shared::error::{Result, SandboxError};
use crate::shared::models::SessionDescriptor;

const DESCRIPTOR_FILE: &str = "session.json";
const ENV_FILE: &str = ".env";

/// Durable session descriptor store: one directory per session under the
/// configured root, holding `session.json` and the runtime `.env` file.
///
/// The descriptor is authoritative at process boot; while a serving process
/// runs, only the standalone tooling (provision, extend, cleanup) writes
/// here. There is no automatic write-back from the in-memory registry.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    root: PathBuf,
}

impl DescriptorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn descriptor_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(DESCRIPTOR_FILE)
    }

    pub fn env_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(ENV_FILE)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.descriptor_path(session_id).is_file()
    }

    pub fn load(&self, session_id: &str) -> Result<SessionDescriptor> {
        let path = self.descriptor_path(session_id);
        let data = fs::read_to_string(&path)
            .map_err(|_| SandboxError::NotFound(format!("session descriptor {session_id}")))?;
        let descriptor: SessionDescriptor = serde_json::from_str(&data)?;
        Ok(descriptor)
    }

    pub fn save(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let dir = self.session_dir(&descriptor.session.session_id);
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_string_pretty(descriptor)?;
        fs::write(dir.join(DESCRIPTOR_FILE), data)?;
        Ok(())
    }

    /// Write the per-session environment file consumed by the orchestration
    /// command. The plaintext secret key lives only here.
    pub fn write_env(&self, descriptor: &SessionDescriptor, secret_key: &str) -> Result<()> {
        let session = &descriptor.session;
        let container = &descriptor.container_config;
        let dir = self.session_dir(&session.session_id);
        fs::create_dir_all(&dir)?;

        let env = format!(
            "SESSION_ID={}\n\
             SESSION_TTL_HOURS={}\n\
             BACKEND_PORT={}\n\
             FRONTEND_PORT={}\n\
             SESSION_SUBNET={}\n\
             SECRET_KEY={}\n\
             COMPOSE_PROJECT_NAME={}\n",
            session.session_id,
            session.ttl_hours,
            container.backend_port,
            container.frontend_port,
            container.subnet,
            secret_key,
            container.compose_project(),
        );
        fs::write(dir.join(ENV_FILE), env)?;
        Ok(())
    }

    /// Remove the whole session directory. Succeeds when already gone.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// All parseable descriptors. Unreadable entries are logged and skipped
    /// so one corrupt directory never hides the rest.
    pub fn list(&self) -> Result<Vec<SessionDescriptor>> {
        let mut descriptors = Vec::new();
        if !self.root.exists() {
            return Ok(descriptors);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&session_id) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!("Skipping unreadable descriptor {}: {}", session_id, e),
            }
        }

        Ok(descriptors)
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|d| d.session.session_id)
            .collect())
    }
}
