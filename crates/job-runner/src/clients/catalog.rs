// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module catalog client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{JsonRpcClient, Result, int_flag};

/// Registered build of a module, as returned by `get_module_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Module name.
    #[serde(default)]
    pub module_name: String,
    /// Container image of this build.
    #[serde(rename = "docker_img_name")]
    pub image: String,
    /// Source repository.
    pub git_url: String,
    /// Commit the image was built from.
    pub git_commit_hash: String,
    /// Semantic version.
    #[serde(default)]
    pub version: Option<String>,
    /// Reference data folder.
    #[serde(default)]
    pub data_folder: Option<String>,
    /// Reference data version.
    #[serde(default)]
    pub data_version: Option<String>,
    /// Secure configuration parameters, filled from a separate lookup.
    #[serde(default)]
    pub secure_config_params: Vec<SecureConfigParam>,
    /// Set when this entry was served from the per-job cache.
    #[serde(skip)]
    pub cached: bool,
}

impl ModuleInfo {
    /// Path of the pinned reference data, relative to the refdata base.
    pub fn refdata_path(&self) -> Option<std::path::PathBuf> {
        match (&self.data_folder, &self.data_version) {
            (Some(folder), Some(version)) => Some(std::path::Path::new(folder).join(version)),
            _ => None,
        }
    }
}

/// A secure configuration parameter injected into the container environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureConfigParam {
    /// Parameter name.
    pub param_name: String,
    /// Parameter value.
    pub param_value: String,
}

/// A host directory mounted into method containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host directory, may contain `${username}`.
    pub host_dir: String,
    /// Mount point inside the container.
    pub container_dir: String,
    /// Mount read-only.
    #[serde(with = "int_flag", default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Host directory with `${username}` substituted.
    pub fn resolve_host_dir(&self, user: &str) -> String {
        self.host_dir.replace("${username}", user)
    }
}

/// Volume mount configuration for a module/method/client group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountConfig {
    /// Module name.
    #[serde(default)]
    pub module_name: String,
    /// Method name.
    #[serde(default)]
    pub function_name: String,
    /// Client group.
    #[serde(default)]
    pub client_group: String,
    /// Mounts.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Module metadata lookups.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve a module (and optional version) to a registered build.
    async fn get_module_version(&self, module: &str, version: Option<&str>) -> Result<ModuleInfo>;

    /// Secure configuration parameters of a module version.
    async fn get_secure_config_params(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<Vec<SecureConfigParam>>;

    /// Volume mount configuration. Requires a privileged token.
    async fn list_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>>;
}

/// JSON-RPC client for the catalog service.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    rpc: JsonRpcClient,
}

impl CatalogClient {
    /// Create a catalog client authenticating with `token`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new(url, "Catalog", Some(token.into()), Duration::from_secs(60))?,
        })
    }
}

fn module_request(module: &str, version: Option<&str>) -> Value {
    let mut req = json!({ "module_name": module });
    if let Some(version) = version {
        req["version"] = json!(version);
    }
    req
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn get_module_version(&self, module: &str, version: Option<&str>) -> Result<ModuleInfo> {
        self.rpc
            .call("get_module_version", vec![module_request(module, version)])
            .await
    }

    async fn get_secure_config_params(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<Vec<SecureConfigParam>> {
        let mut req = module_request(module, version);
        req["load_all_versions"] = json!(0);
        let params: Option<Vec<SecureConfigParam>> = self
            .rpc
            .call("get_secure_config_params", vec![req])
            .await?;
        Ok(params.unwrap_or_default())
    }

    async fn list_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>> {
        let req = json!({
            "module_name": module,
            "function_name": method,
            "client_group": client_group,
        });
        let mounts: Option<Vec<VolumeMountConfig>> =
            self.rpc.call("list_volume_mounts", vec![req]).await?;
        Ok(mounts.unwrap_or_default())
    }
}
