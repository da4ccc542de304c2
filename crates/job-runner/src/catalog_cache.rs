// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-job module metadata cache.
//!
//! A job pins one build per module. The first resolution of a module asks the
//! catalog, every later resolution of the same module name returns the stored
//! entry with `cached = true`, ignoring any version argument.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clients::{Catalog, ModuleInfo, Result, VolumeMount};

/// What to do when a module is resolved a second time within a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Log a warning naming the pinned and requested versions.
    #[default]
    Warn,
    /// Reuse the entry without a warning.
    Silent,
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "silent" => Ok(Self::Silent),
            other => Err(format!("unknown cache policy: {}", other)),
        }
    }
}

/// Module metadata cache, owned by the orchestrator for one job run.
pub struct CatalogCache {
    catalog: Arc<dyn Catalog>,
    admin_catalog: Option<Arc<dyn Catalog>>,
    policy: CachePolicy,
    modules: HashMap<String, ModuleInfo>,
}

impl CatalogCache {
    /// Create a cache. `admin_catalog` authenticates with the privileged token
    /// and is only used for volume mount lookups.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        admin_catalog: Option<Arc<dyn Catalog>>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            catalog,
            admin_catalog,
            policy,
            modules: HashMap::new(),
        }
    }

    /// Resolve a module to its build, consulting the catalog only once per module.
    pub async fn resolve(&mut self, module: &str, version: Option<&str>) -> Result<ModuleInfo> {
        if let Some(info) = self.modules.get_mut(module) {
            info.cached = true;
            match self.policy {
                CachePolicy::Warn => warn!(
                    module = %module,
                    pinned = ?info.version,
                    requested = ?version,
                    "Module already resolved in this job, cached version may differ from the requested one"
                ),
                CachePolicy::Silent => debug!(module = %module, "Using cached module info"),
            }
            return Ok(info.clone());
        }

        let mut info = self.catalog.get_module_version(module, version).await?;
        info.secure_config_params = self
            .catalog
            .get_secure_config_params(module, version)
            .await?;
        if info.module_name.is_empty() {
            info.module_name = module.to_string();
        }
        info.cached = false;
        debug!(module = %module, image = %info.image, "Resolved module");
        self.modules.insert(module.to_string(), info.clone());
        Ok(info)
    }

    /// Volume mounts configured for a method in a client group.
    ///
    /// Returns `None` without a privileged catalog, `Some(vec![])` when the
    /// method simply has no mounts. Never cached.
    pub async fn resolve_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Option<Vec<VolumeMount>>> {
        let Some(admin) = &self.admin_catalog else {
            return Ok(None);
        };
        let configs = admin
            .list_volume_mounts(module, method, client_group)
            .await?;
        Ok(Some(
            configs
                .into_iter()
                .next()
                .map(|c| c.volume_mounts)
                .unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockCatalog, module_info};
    use crate::clients::{SecureConfigParam, VolumeMountConfig};

    fn catalog() -> Arc<MockCatalog> {
        Arc::new(
            MockCatalog::new()
                .with_module(module_info("mock_app", "mock_app:latest"))
                .with_secure_params(
                    "mock_app",
                    vec![SecureConfigParam {
                        param_name: "api_key".to_string(),
                        param_value: "s3cr3t".to_string(),
                    }],
                )
                .with_volume_mounts(vec![VolumeMountConfig {
                    module_name: "mock_app".to_string(),
                    function_name: "bogus".to_string(),
                    client_group: "njs".to_string(),
                    volume_mounts: vec![VolumeMount {
                        host_dir: "/tmp/${username}".to_string(),
                        container_dir: "/staging".to_string(),
                        read_only: true,
                    }],
                }]),
        )
    }

    #[tokio::test]
    async fn test_second_resolution_is_cached() {
        let catalog = catalog();
        let mut cache = CatalogCache::new(catalog.clone(), None, CachePolicy::Warn);

        let first = cache.resolve("mock_app", None).await.unwrap();
        let second = cache.resolve("mock_app", Some("beta")).await.unwrap();
        let third = cache.resolve("mock_app", None).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert!(third.cached);
        assert_eq!(catalog.lookups(), 1);
        assert_eq!(first.secure_config_params.len(), 1);
        assert_eq!(ModuleInfo { cached: true, ..first }, second);
    }

    #[tokio::test]
    async fn test_silent_policy_still_flags_cached() {
        let mut cache = CatalogCache::new(catalog(), None, CachePolicy::Silent);
        cache.resolve("mock_app", None).await.unwrap();
        assert!(cache.resolve("mock_app", None).await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_lookup_error_propagates() {
        let mut cache = CatalogCache::new(catalog(), None, CachePolicy::Warn);
        assert!(cache.resolve("missing", None).await.is_err());
    }

    #[tokio::test]
    async fn test_volume_mounts_need_admin_catalog() {
        let catalog = catalog();
        let cache = CatalogCache::new(catalog.clone(), None, CachePolicy::Warn);
        let mounts = cache
            .resolve_volume_mounts("mock_app", "bogus", "njs")
            .await
            .unwrap();
        assert!(mounts.is_none());
        assert_eq!(catalog.mount_lookups(), 0);

        let cache = CatalogCache::new(catalog.clone(), Some(catalog.clone()), CachePolicy::Warn);
        let mounts = cache
            .resolve_volume_mounts("mock_app", "bogus", "njs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].container_dir, "/staging");

        let none = cache
            .resolve_volume_mounts("mock_app", "other", "njs")
            .await
            .unwrap();
        assert_eq!(none, Some(vec![]));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("warn".parse::<CachePolicy>().unwrap(), CachePolicy::Warn);
        assert_eq!("SILENT".parse::<CachePolicy>().unwrap(), CachePolicy::Silent);
        assert!("loud".parse::<CachePolicy>().is_err());
    }
}
