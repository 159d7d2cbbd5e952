use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::domain::{HealthState, ProcessKind, ServiceDeclaration, ServiceSource};

/// Highest schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 2;

const LOCK_POLL_MS: u64 = 25;

/// One reconciled service: the declaration plus runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub declaration: ServiceDeclaration,
    pub source: ServiceSource,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    #[serde(default)]
    pub tunnel_session_id: Option<String>,
    #[serde(default)]
    pub tunnel_last_error: Option<String>,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub last_health_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_health_result: HealthState,
    #[serde(default)]
    pub process_kind: ProcessKind,
    #[serde(default)]
    pub process_id: Option<i32>,
    #[serde(default)]
    pub allocated_port: Option<u16>,
}

impl RegistryEntry {
    pub fn from_declaration(declaration: ServiceDeclaration, source: ServiceSource) -> Self {
        Self {
            declaration,
            source,
            tunnel_url: None,
            tunnel_session_id: None,
            tunnel_last_error: None,
            last_health_at: None,
            last_health_result: HealthState::Unknown,
            process_kind: ProcessKind::Binary,
            process_id: None,
            allocated_port: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.declaration.id
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: Vec<RegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self { version: SCHEMA_VERSION, entries: Vec::new() }
    }
}

/// Version 1 kept bare declarations under a `services` key; runtime state
/// arrived with version 2.
#[derive(Debug, Deserialize)]
struct RegistryFileV1 {
    #[serde(default)]
    services: Vec<ServiceDeclaration>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry lock still held after {0:?}")]
    LockContention(Duration),
    #[error("registry file is corrupt ({0}); run `asd net reset`")]
    Corrupt(String),
    #[error("registry version {found} is newer than supported {supported}; run `asd net reset` or upgrade asd")]
    FutureVersion { found: u32, supported: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub public_only: bool,
    pub source: Option<ServiceSource>,
    pub ids: Option<Vec<String>>,
}

/// The only persistent mutable resource shared across invocations. Writes go
/// through an advisory lock on a sidecar file with a bounded acquisition
/// deadline, and land via temp-file + rename.
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl Registry {
    pub fn open(path: &Path) -> Self {
        const LOCK_TIMEOUT_SECS: u64 = 5;
        Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
            lock_timeout: Duration::from_secs(LOCK_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// All entries. Reads do not take the lock; writes are atomic renames.
    pub fn load(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self.read_file()?.entries)
    }

    /// Entries plus the schema version actually stored on disk.
    pub fn snapshot(&self) -> Result<(u32, Vec<RegistryEntry>), RegistryError> {
        let file = self.read_file()?;
        Ok((file.version, file.entries))
    }

    pub fn get(&self, id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.load()?.into_iter().find(|e| e.id() == id))
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RegistryEntry>, RegistryError> {
        let mut entries = self.load()?;
        if filter.public_only {
            entries.retain(|e| e.declaration.is_public());
        }
        if let Some(source) = filter.source {
            entries.retain(|e| e.source == source);
        }
        if let Some(ids) = &filter.ids {
            entries.retain(|e| ids.iter().any(|id| id == e.id()));
        }
        Ok(entries)
    }

    /// Insert or replace by id. An entry keeps its runtime state when the
    /// incoming declaration matches an existing id (declared fields win,
    /// runtime fields survive).
    pub fn upsert(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.mutate(|file| {
            match file.entries.iter_mut().find(|e| e.id() == entry.id()) {
                Some(existing) => {
                    let runtime = existing.clone();
                    *existing = RegistryEntry {
                        tunnel_url: runtime.tunnel_url,
                        tunnel_session_id: runtime.tunnel_session_id,
                        tunnel_last_error: runtime.tunnel_last_error,
                        last_health_at: runtime.last_health_at,
                        last_health_result: runtime.last_health_result,
                        allocated_port: entry.allocated_port.or(runtime.allocated_port),
                        ..entry.clone()
                    };
                }
                None => file.entries.push(entry.clone()),
            }
            true
        })
    }

    pub fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut removed = false;
        self.mutate(|file| {
            let before = file.entries.len();
            file.entries.retain(|e| e.id() != id);
            removed = file.entries.len() != before;
            removed
        })?;
        Ok(removed)
    }

    pub fn mark_health(
        &self,
        id: &str,
        state: HealthState,
        at: OffsetDateTime,
    ) -> Result<bool, RegistryError> {
        let mut found = false;
        self.mutate(|file| {
            if let Some(entry) = file.entries.iter_mut().find(|e| e.id() == id) {
                entry.last_health_result = state;
                entry.last_health_at = Some(at);
                found = true;
            }
            found
        })?;
        Ok(found)
    }

    /// Set or clear the tunnel runtime fields. Clearing also drops the
    /// session id, clears any stored error on set.
    pub fn set_tunnel(
        &self,
        id: &str,
        url: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<bool, RegistryError> {
        let mut found = false;
        self.mutate(|file| {
            if let Some(entry) = file.entries.iter_mut().find(|e| e.id() == id) {
                entry.tunnel_url = url.map(str::to_string);
                entry.tunnel_session_id = session_id.map(str::to_string);
                if url.is_some() {
                    entry.tunnel_last_error = None;
                }
                found = true;
            }
            found
        })?;
        Ok(found)
    }

    pub fn set_tunnel_error(&self, id: &str, error: &str) -> Result<bool, RegistryError> {
        let mut found = false;
        self.mutate(|file| {
            if let Some(entry) = file.entries.iter_mut().find(|e| e.id() == id) {
                entry.tunnel_last_error = Some(error.to_string());
                found = true;
            }
            found
        })?;
        Ok(found)
    }

    /// Drop every entry and rewrite an empty registry at the current version.
    pub fn reset(&self) -> Result<(), RegistryError> {
        let _lock = self.acquire_lock()?;
        self.write_file(&RegistryFile::default())
    }

    fn mutate(&self, f: impl FnOnce(&mut RegistryFile) -> bool) -> Result<(), RegistryError> {
        let _lock = self.acquire_lock()?;
        let mut file = self.read_file()?;
        let dirty = f(&mut file);
        if dirty {
            file.version = SCHEMA_VERSION;
            self.write_file(&file)?;
        }
        Ok(())
    }

    fn acquire_lock(&self) -> Result<LockGuard, RegistryError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(LOCK_POLL_MS));
                }
                Err(_) => return Err(RegistryError::LockContention(self.lock_timeout)),
            }
        }
    }

    fn read_file(&self) -> Result<RegistryFile, RegistryError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryFile::default())
            }
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| RegistryError::Corrupt("missing version field".to_string()))?
            as u32;

        match version {
            v if v > SCHEMA_VERSION => Err(RegistryError::FutureVersion {
                found: v,
                supported: SCHEMA_VERSION,
            }),
            1 => {
                let v1: RegistryFileV1 = serde_json::from_value(value)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
                info!(entries = v1.services.len(), "migrating registry schema v1 -> v2");
                Ok(RegistryFile {
                    version: SCHEMA_VERSION,
                    entries: v1
                        .services
                        .into_iter()
                        .map(|decl| RegistryEntry::from_declaration(decl, ServiceSource::Config))
                        .collect(),
                })
            }
            _ => serde_json::from_value(value).map_err(|e| RegistryError::Corrupt(e.to_string())),
        }
    }

    fn write_file(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let rendered = serde_json::to_string_pretty(file)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = file.entries.len(), "registry written");
        Ok(())
    }
}

struct LockGuard {
    file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_registry(label: &str) -> Registry {
        let dir = std::env::temp_dir().join(format!("asd-test-reg-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Registry::open(&dir.join("registry.json"))
    }

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry::from_declaration(
            ServiceDeclaration {
                id: id.to_string(),
                dial: Some("127.0.0.1:3000".to_string()),
                public: Some(true),
                subdomain: Some(id.to_string()),
                ..Default::default()
            },
            ServiceSource::Config,
        )
    }

    #[test]
    fn upsert_then_load_roundtrips() {
        let reg = temp_registry("roundtrip");
        let e = entry("myapp");
        reg.upsert(e.clone()).unwrap();
        let loaded = reg.get("myapp").unwrap().expect("entry present");
        assert_eq!(loaded, e);
    }

    #[test]
    fn upsert_preserves_runtime_state() {
        let reg = temp_registry("runtime");
        reg.upsert(entry("myapp")).unwrap();
        reg.set_tunnel("myapp", Some("https://myapp-fkmc.cicd.eu1.asd.engineer"), Some("s1"))
            .unwrap();

        // Re-declaring the service must not wipe the live tunnel fields.
        reg.upsert(entry("myapp")).unwrap();
        let loaded = reg.get("myapp").unwrap().unwrap();
        assert_eq!(
            loaded.tunnel_url.as_deref(),
            Some("https://myapp-fkmc.cicd.eu1.asd.engineer")
        );
        assert_eq!(loaded.tunnel_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn remove_and_missing_ids() {
        let reg = temp_registry("remove");
        reg.upsert(entry("a")).unwrap();
        assert!(reg.remove("a").unwrap());
        assert!(!reg.remove("a").unwrap());
        assert!(reg.get("a").unwrap().is_none());
    }

    #[test]
    fn mark_health_records_state_and_time() {
        let reg = temp_registry("health");
        reg.upsert(entry("svc")).unwrap();
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert!(reg.mark_health("svc", HealthState::Ok, at).unwrap());
        let loaded = reg.get("svc").unwrap().unwrap();
        assert_eq!(loaded.last_health_result, HealthState::Ok);
        assert_eq!(loaded.last_health_at, Some(at));
        assert!(!reg.mark_health("missing", HealthState::Ok, at).unwrap());
    }

    #[test]
    fn clearing_tunnel_drops_url_and_session() {
        let reg = temp_registry("clear");
        reg.upsert(entry("svc")).unwrap();
        reg.set_tunnel("svc", Some("https://x.example.com"), Some("s1")).unwrap();
        reg.set_tunnel("svc", None, None).unwrap();
        let loaded = reg.get("svc").unwrap().unwrap();
        assert_eq!(loaded.tunnel_url, None);
        assert_eq!(loaded.tunnel_session_id, None);
    }

    #[test]
    fn list_filters() {
        let reg = temp_registry("filters");
        let mut private = entry("private");
        private.declaration.public = Some(false);
        reg.upsert(private).unwrap();
        reg.upsert(entry("public")).unwrap();

        let public = reg
            .list(&ListFilter { public_only: true, ..Default::default() })
            .unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].id(), "public");

        let by_id = reg
            .list(&ListFilter { ids: Some(vec!["private".into()]), ..Default::default() })
            .unwrap();
        assert_eq!(by_id.len(), 1);
    }

    #[test]
    fn v1_file_migrates_forward() {
        let reg = temp_registry("migrate");
        fs::write(
            &reg.path,
            r#"{ "version": 1, "services": [ { "id": "legacy", "dial": "127.0.0.1:9000" } ] }"#,
        )
        .unwrap();
        let (version, entries) = reg.snapshot().unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), "legacy");
        assert_eq!(entries[0].last_health_result, HealthState::Unknown);
    }

    #[test]
    fn future_version_is_refused() {
        let reg = temp_registry("future");
        fs::write(&reg.path, r#"{ "version": 99, "entries": [] }"#).unwrap();
        match reg.load() {
            Err(RegistryError::FutureVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected FutureVersion, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let reg = temp_registry("corrupt");
        fs::write(&reg.path, "{ not json").unwrap();
        assert!(matches!(reg.load(), Err(RegistryError::Corrupt(_))));
    }

    #[test]
    fn lock_contention_times_out() {
        let reg = temp_registry("lock").with_lock_timeout(Duration::from_millis(150));
        // Hold the lock from a second handle for longer than the timeout.
        let holder = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&reg.lock_path)
            .unwrap();
        holder.try_lock_exclusive().unwrap();

        let result = reg.upsert(entry("blocked"));
        assert!(matches!(result, Err(RegistryError::LockContention(_))));
        fs2::FileExt::unlock(&holder).unwrap();
    }
}
