//! Registry credentials.
//!
//! The registry client never looks credentials up from ambient state: a
//! [`CredentialProvider`] is injected at construction and asked for the
//! credential of a host on every push or fetch, so rotated secrets are
//! picked up without restarting.
//!
//! The persistent [`CredentialStore`] keeps per-registry credentials at
//! `~/.a3s/auth/credentials.json` with atomic writes (write tmp, rename).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use a3s_oci_core::{OciError, Result};
use serde::{Deserialize, Serialize};

/// Credential for one registry host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    /// Pre-issued bearer token (identity token)
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Credential::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Source of registry credentials keyed by host.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, host: &str) -> Result<Credential>;
}

/// No credentials for any host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credential(&self, _host: &str) -> Result<Credential> {
        Ok(Credential::Anonymous)
    }
}

/// Fixed per-host credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, credential: Credential) -> Self {
        self.entries.insert(normalize_registry(host), credential);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, host: &str) -> Result<Credential> {
        Ok(self
            .entries
            .get(&normalize_registry(host))
            .cloned()
            .unwrap_or(Credential::Anonymous))
    }
}

/// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, for every host.
///
/// Variables are read on each lookup. Anonymous if either is unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credential(&self, _host: &str) -> Result<Credential> {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        Ok(match (username, password) {
            (Some(username), Some(password)) => Credential::Basic { username, password },
            _ => Credential::Anonymous,
        })
    }
}

/// First non-anonymous answer from an ordered list of providers.
#[derive(Clone, Default)]
pub struct CredentialChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Credential store at the default path, then environment variables.
    pub fn default_chain() -> Result<Self> {
        Ok(Self::new(vec![
            Arc::new(CredentialStore::default_path()?),
            Arc::new(EnvCredentials),
        ]))
    }
}

impl CredentialProvider for CredentialChain {
    fn credential(&self, host: &str) -> Result<Credential> {
        for provider in &self.providers {
            let credential = provider.credential(host)?;
            if !credential.is_anonymous() {
                return Ok(credential);
            }
        }
        Ok(Credential::Anonymous)
    }
}

/// Per-registry credential entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

/// Persistent credential file format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: HashMap<String, CredentialEntry>,
}

/// Persistent credential store for container registries.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a credential store at the default path (`~/.a3s/auth/credentials.json`).
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            OciError::ConfigError("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self {
            path: home.join(".a3s").join("auth").join("credentials.json"),
        })
    }

    /// Create a credential store at a custom path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry. Overwrites existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Get credentials for a registry. Returns `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        Ok(file
            .registries
            .get(&normalize_registry(registry))
            .map(|e| (e.username.clone(), e.password.clone())))
    }

    /// Remove credentials for a registry. Returns true if entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file
            .registries
            .remove(&normalize_registry(registry))
            .is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            OciError::ConfigError(format!(
                "Failed to read credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            OciError::ConfigError(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(file)?;
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            OciError::ConfigError(format!(
                "Failed to rename credential store {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })
    }
}

impl CredentialProvider for CredentialStore {
    fn credential(&self, host: &str) -> Result<Credential> {
        Ok(match self.get(host)? {
            Some((username, password)) => Credential::Basic { username, password },
            None => Credential::Anonymous,
        })
    }
}

/// Normalize registry names (e.g., "docker.io" and "registry-1.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("credentials.json"))
    }

    #[test]
    fn test_store_and_lookup() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert_eq!(
            store.credential("ghcr.io").unwrap(),
            Credential::basic("user1", "pass1")
        );
        assert_eq!(store.credential("quay.io").unwrap(), Credential::Anonymous);
    }

    #[test]
    fn test_lookup_sees_rotation() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user", "old").unwrap();
        // Another process rewrites the file.
        CredentialStore::new(dir.path().join("credentials.json"))
            .store("ghcr.io", "user", "new")
            .unwrap();
        assert_eq!(
            store.credential("ghcr.io").unwrap(),
            Credential::basic("user", "new")
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_io_normalization() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        assert!(store.get("index.docker.io").unwrap().is_some());
        assert!(store.get("registry-1.docker.io").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("credentials.json"), "{").unwrap();
        let err = test_store(&dir).credential("ghcr.io").unwrap_err();
        assert!(matches!(err, OciError::ConfigError(_)));
    }

    #[test]
    fn test_static_and_chain() {
        let first = StaticCredentials::new().with("ghcr.io", Credential::basic("a", "1"));
        let second = StaticCredentials::new()
            .with("ghcr.io", Credential::basic("b", "2"))
            .with("quay.io", Credential::Bearer("tok".to_string()));
        let chain = CredentialChain::new(vec![Arc::new(first), Arc::new(second)]);

        assert_eq!(chain.credential("ghcr.io").unwrap(), Credential::basic("a", "1"));
        assert_eq!(
            chain.credential("quay.io").unwrap(),
            Credential::Bearer("tok".to_string())
        );
        assert_eq!(chain.credential("example.com").unwrap(), Credential::Anonymous);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let debug = format!("{:?}", Credential::basic("user", "hunter2"));
        assert!(!debug.contains("hunter2"));
        assert!(!format!("{:?}", Credential::Bearer("tok".to_string())).contains("tok"));
    }
}
