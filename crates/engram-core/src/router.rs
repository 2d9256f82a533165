//! Project Router
//!
//! Maps working directories onto per-project stores. A project's identity
//! is the first 8 hex chars of the SHA-256 of its resolved path, which
//! names its subdirectory under `base/projects/`. A session registry JSON
//! remembers which project each session belongs to so later hooks can
//! route by session id alone.
//!
//! Service instances are cached per project hash within the process; the
//! read-only accessors open fresh connections per request so dashboards
//! never block the writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::MemoryConfig;
use crate::service::MemoryService;
use crate::shared::{SharedStore, SharedStoreHandle};
use crate::storage::{EventStore, Result, StoreError};

/// Registry file name under the base directory
const REGISTRY_FILE: &str = "session-registry.json";

/// Most-recent sessions kept in the registry
const REGISTRY_CAP: usize = 1000;

/// Directory for the project-independent store
const GLOBAL_DIR: &str = "global";

/// Compute a project's stable hash: first 8 hex chars of
/// SHA-256(realpath). An unresolvable path hashes as given, so routing
/// still works for directories that disappeared.
pub fn project_hash(project_path: &Path) -> String {
    let resolved = std::fs::canonicalize(project_path)
        .unwrap_or_else(|_| project_path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(resolved.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

/// Where a project's store lives under the base directory
pub fn project_storage_path(base: &Path, project_path: &Path) -> PathBuf {
    base.join("projects").join(project_hash(project_path))
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

/// One registered session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub project_path: PathBuf,
    pub project_hash: String,
    pub registered_at: DateTime<Utc>,
}

/// `session_id → project` routing table, persisted as JSON and capped to
/// the most recent [`REGISTRY_CAP`] sessions
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sessions: HashMap<String, RegistryEntry>,
}

/// The on-disk session registry
pub struct SessionRegistry {
    path: PathBuf,
    entries: RegistryFile,
}

impl SessionRegistry {
    /// Load the registry, treating a missing or unreadable file as empty
    pub fn load(base: &Path) -> Self {
        let path = base.join(REGISTRY_FILE);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    /// Register (or refresh) a session's project
    pub fn register(&mut self, session_id: &str, project_path: &Path) -> Result<()> {
        self.entries.sessions.insert(
            session_id.to_string(),
            RegistryEntry {
                project_path: project_path.to_path_buf(),
                project_hash: project_hash(project_path),
                registered_at: Utc::now(),
            },
        );

        if self.entries.sessions.len() > REGISTRY_CAP {
            let mut by_age: Vec<(String, DateTime<Utc>)> = self
                .entries
                .sessions
                .iter()
                .map(|(id, e)| (id.clone(), e.registered_at))
                .collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1));
            for (id, _) in by_age.into_iter().skip(REGISTRY_CAP) {
                self.entries.sessions.remove(&id);
            }
        }

        self.save()
    }

    /// Look up a session's project
    pub fn lookup(&self, session_id: &str) -> Option<&RegistryEntry> {
        self.entries.sessions.get(session_id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.entries.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.sessions.is_empty()
    }

    /// Atomic write: temp file then rename, so concurrent readers never
    /// see a torn registry
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// The process-wide router from paths and sessions to service instances
pub struct ProjectRouter {
    base: PathBuf,
    config: MemoryConfig,
    services: Mutex<HashMap<String, Arc<MemoryService>>>,
    shared: Mutex<Option<Arc<SharedStoreHandle>>>,
    registry: Mutex<SessionRegistry>,
}

impl ProjectRouter {
    /// Build a router over the configured base directory
    pub fn new(config: MemoryConfig) -> Self {
        let base = config.resolve_base_dir();
        let registry = SessionRegistry::load(&base);
        Self {
            base,
            config,
            services: Mutex::new(HashMap::new()),
            shared: Mutex::new(None),
            registry: Mutex::new(registry),
        }
    }

    /// Load configuration from the default base directory and build the
    /// router
    pub fn from_disk() -> Self {
        let probe = MemoryConfig::default();
        let base = probe.resolve_base_dir();
        let config = MemoryConfig::load(&base).unwrap_or_else(|e| {
            tracing::warn!("Config load failed, using defaults: {}", e);
            MemoryConfig::default()
        });
        Self::new(config)
    }

    /// The base storage directory
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Effective configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The project-independent service
    pub fn get_global_service(&self) -> Result<Arc<MemoryService>> {
        self.service_for_dir(GLOBAL_DIR.to_string(), self.base.join(GLOBAL_DIR), None)
    }

    /// The service for a project directory
    pub fn get_service_for_project(&self, project_path: &Path) -> Result<Arc<MemoryService>> {
        let hash = project_hash(project_path);
        let dir = self.base.join("projects").join(&hash);
        self.service_for_dir(hash.clone(), dir, Some(hash))
    }

    /// The service for a registered session, falling back to the global
    /// service for unknown sessions
    pub fn get_service_for_session(&self, session_id: &str) -> Result<Arc<MemoryService>> {
        let project_path = {
            let registry = self
                .registry
                .lock()
                .map_err(|_| StoreError::Unavailable("Registry lock poisoned".into()))?;
            registry.lookup(session_id).map(|e| e.project_path.clone())
        };
        match project_path {
            Some(path) => self.get_service_for_project(&path),
            None => self.get_global_service(),
        }
    }

    /// A bare event store for latency-sensitive hooks: no embedder, no
    /// vector index, no workers
    pub fn get_lightweight_store(&self, session_id: &str) -> Result<Arc<EventStore>> {
        let dir = {
            let registry = self
                .registry
                .lock()
                .map_err(|_| StoreError::Unavailable("Registry lock poisoned".into()))?;
            match registry.lookup(session_id) {
                Some(entry) => self.base.join("projects").join(&entry.project_hash),
                None => self.base.join(GLOBAL_DIR),
            }
        };
        Ok(Arc::new(EventStore::open(
            &dir.join("events.db"),
            self.config.worker.max_retries,
        )?))
    }

    /// A fresh read-only store for dashboard-style callers
    pub fn get_read_only_store(&self, project_path: &Path) -> Result<EventStore> {
        let dir = project_storage_path(&self.base, project_path);
        EventStore::open_read_only(&dir.join("events.db"))
    }

    /// Bind a session to its project in the registry
    pub fn register_session(&self, session_id: &str, project_path: &Path) -> Result<()> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| StoreError::Unavailable("Registry lock poisoned".into()))?;
        registry.register(session_id, project_path)
    }

    fn service_for_dir(
        &self,
        cache_key: String,
        dir: PathBuf,
        hash: Option<String>,
    ) -> Result<Arc<MemoryService>> {
        {
            let services = self
                .services
                .lock()
                .map_err(|_| StoreError::Unavailable("Service cache lock poisoned".into()))?;
            if let Some(service) = services.get(&cache_key) {
                return Ok(Arc::clone(service));
            }
        }

        let shared = self.shared_handle()?;
        let service = MemoryService::open(&dir, self.config.clone(), hash, shared)?;

        let mut services = self
            .services
            .lock()
            .map_err(|_| StoreError::Unavailable("Service cache lock poisoned".into()))?;
        Ok(Arc::clone(
            services.entry(cache_key).or_insert(service),
        ))
    }

    /// The shared store handle, opened lazily when the feature is enabled
    pub fn shared_handle(&self) -> Result<Option<Arc<SharedStoreHandle>>> {
        if !self.config.features.shared_store.enabled {
            return Ok(None);
        }
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| StoreError::Unavailable("Shared store lock poisoned".into()))?;
        if let Some(handle) = shared.as_ref() {
            return Ok(Some(Arc::clone(handle)));
        }
        let dir = self
            .config
            .features
            .shared_store
            .shared_storage_path
            .clone()
            .unwrap_or_else(|| self.base.join("shared"));
        let embedder: Arc<dyn crate::embeddings::Embedder> = {
            #[cfg(feature = "embeddings")]
            {
                Arc::new(crate::embeddings::LocalEmbedder::new())
            }
            #[cfg(not(feature = "embeddings"))]
            {
                Arc::new(crate::embeddings::HashingEmbedder::default())
            }
        };
        let handle = Arc::new(SharedStore::open(
            &dir,
            embedder,
            self.config.features.shared_store.min_confidence_for_promotion,
        )?);
        *shared = Some(Arc::clone(&handle));
        Ok(Some(handle))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn router(dir: &TempDir) -> ProjectRouter {
        let mut config = MemoryConfig::default();
        config.storage.path = Some(dir.path().to_path_buf());
        ProjectRouter::new(config)
    }

    #[test]
    fn test_project_hash_is_stable_8_hex() {
        let dir = TempDir::new().unwrap();
        let a = project_hash(dir.path());
        let b = project_hash(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_project_storage_layout() {
        let base = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let path = project_storage_path(base.path(), project.path());
        assert!(path.starts_with(base.path().join("projects")));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            project_hash(project.path())
        );
    }

    #[test]
    fn test_registry_roundtrip_and_atomic_write() {
        let base = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        {
            let mut registry = SessionRegistry::load(base.path());
            registry.register("s1", project.path()).unwrap();
            assert_eq!(registry.len(), 1);
        }
        let registry = SessionRegistry::load(base.path());
        let entry = registry.lookup("s1").unwrap();
        assert_eq!(entry.project_hash, project_hash(project.path()));
        assert!(registry.lookup("s2").is_none());
        // No temp file left behind
        assert!(!base.path().join("session-registry.json.tmp").exists());
    }

    #[test]
    fn test_registry_treats_garbage_as_empty() {
        let base = TempDir::new().unwrap();
        std::fs::write(base.path().join(REGISTRY_FILE), "{broken").unwrap();
        let registry = SessionRegistry::load(base.path());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_router_caches_service_per_project() {
        let base = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let router = router(&base);

        let a = router.get_service_for_project(project.path()).unwrap();
        let b = router.get_service_for_project(project.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_session_falls_back_to_global() {
        let base = TempDir::new().unwrap();
        let router = router(&base);
        let service = router.get_service_for_session("mystery").unwrap();
        assert!(service.project_hash().is_none());
    }

    #[test]
    fn test_registered_session_routes_to_project() {
        let base = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let router = router(&base);

        router.register_session("s1", project.path()).unwrap();
        let service = router.get_service_for_session("s1").unwrap();
        assert_eq!(service.project_hash(), Some(project_hash(project.path()).as_str()));
    }

    #[test]
    fn test_lightweight_store_appends() {
        let base = TempDir::new().unwrap();
        let router = router(&base);
        let store = router.get_lightweight_store("nobody").unwrap();
        let result = store
            .append(crate::events::AppendInput::new(
                crate::events::EventType::UserPrompt,
                "nobody",
                "fast path",
            ))
            .unwrap();
        assert!(!result.is_duplicate);
    }
}
