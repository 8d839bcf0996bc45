//! Tenant registry: loads, validates, and serves tenant configurations.
//!
//! Backend: a directory of YAML files, one per tenant. The registry is
//! initialized once at startup via [`TenantRegistry::load_all`] and supports
//! hot reload. Readers always see a complete snapshot: the map is replaced
//! with a single atomic swap, and a load that fails validation leaves the
//! previous snapshot untouched.

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Yaml},
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::errors::{Error, Result};
use crate::tenant::models::TenantConfig;

pub struct TenantRegistry {
    config_dir: PathBuf,
    configs: ArcSwap<HashMap<String, Arc<TenantConfig>>>,
}

impl TenantRegistry {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            configs: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Scan the config directory for `*.yaml` files and parse each into a
    /// [`TenantConfig`]. The in-memory map is replaced atomically on
    /// success; any validation failure surfaces as [`Error::ConfigInvalid`]
    /// and preserves the previous snapshot.
    ///
    /// Returns the number of tenants loaded.
    pub fn load_all(&self) -> Result<usize> {
        if !self.config_dir.is_dir() {
            return Err(Error::ConfigInvalid {
                path: self.config_dir.display().to_string(),
                message: "tenant config directory not found".to_string(),
            });
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.config_dir)
            .map_err(|e| Error::ConfigInvalid {
                path: self.config_dir.display().to_string(),
                message: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
            .collect();
        paths.sort();

        let mut new_configs: HashMap<String, Arc<TenantConfig>> = HashMap::new();
        for path in &paths {
            let cfg = Self::load_one(path)?;
            info!(
                tenant_id = %cfg.tenant_id,
                file = %path.display(),
                "Loaded tenant config"
            );
            new_configs.insert(cfg.tenant_id.clone(), Arc::new(cfg));
        }

        let count = new_configs.len();
        self.configs.store(Arc::new(new_configs));
        info!("Tenant registry loaded {count} tenant(s)");
        Ok(count)
    }

    fn load_one(path: &PathBuf) -> Result<TenantConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Figment::new()
            .merge(Yaml::string(&raw))
            .extract()
            .map_err(|e| Error::ConfigInvalid {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }

    /// Return the snapshot for `tenant_id`, or `None` if unknown.
    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        self.configs.load().get(tenant_id).cloned()
    }

    /// Hot-reload all configs from disk without dropping in-flight requests.
    /// Safe under concurrent `get` calls.
    pub fn reload(&self) -> Result<usize> {
        info!("Hot-reloading tenant configs from {}", self.config_dir.display());
        self.load_all()
    }

    /// Sorted list of all registered tenant IDs.
    pub fn all_tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.configs.load().len()
    }

    /// The current snapshot, for startup-time connector construction.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<TenantConfig>>> {
        self.configs.load_full()
    }
}
