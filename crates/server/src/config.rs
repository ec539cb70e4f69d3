#![forbid(unsafe_code)]

use crate::allocator::AllocatorConfig;
use crate::http::RequestDefaults;
use crate::pool::{BoskosPool, DEFAULT_RESOURCE_TYPE, PoolError, ResourcePool, StaticProjectPool};
use clap::Parser;
use dkcm_runner::{ClusterConfig, ConfigError, DEFAULT_PROGRAM, DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    #[error("configure either --project-id or --boskos-host")]
    NoResourcePool,
    #[error("resource pool: {0}")]
    Pool(#[from] PoolError),
    #[error("cluster config: {0}")]
    Cluster(#[from] ConfigError),
    #[error("cannot find provisioning program {0:?}")]
    ProgramNotFound(String),
}

/// dkcm_server: lease e2e GKE clusters to CI jobs over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "dkcm_server", version, about, long_about = None)]
pub struct ServerConfig {
    /// Directory holding dkcm.db.
    #[arg(long, env = "DKCM_STORAGE_DIR", default_value = ".dkcm")]
    pub storage_dir: PathBuf,
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// 0 picks a free port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "DKCM_PROVISION_BIN", default_value = DEFAULT_PROGRAM)]
    pub provision_bin: String,
    /// Base YAML cluster config; lease parameters override it.
    #[arg(long, env = "DKCM_CLUSTER_CONFIG")]
    pub cluster_config: Option<PathBuf>,
    /// Regions tried after a stockout in the requested one. Comma-separated.
    #[arg(long, value_delimiter = ',', default_value = "us-central1,us-east1")]
    pub backup_regions: Vec<String>,
    /// Per-lease attempt logs. Defaults to `<storage-dir>/work`.
    #[arg(long, env = "DKCM_WORK_DIR")]
    pub work_dir: Option<PathBuf>,
    /// Seconds between SIGTERM and SIGKILL when a creation is stopped.
    #[arg(long, default_value_t = 10)]
    pub term_grace_s: u64,
    /// Run after a cluster comes up; its output is recorded as the cluster version.
    /// Split on whitespace. Empty skips it.
    #[arg(long, env = "DKCM_VERSION_COMMAND", default_value = "kubectl version --short=true")]
    pub version_command: String,

    /// Lease every cluster in this one project instead of using boskos.
    #[arg(long, env = "DKCM_GCP_PROJECT")]
    pub project_id: Option<String>,
    #[arg(long, env = "BOSKOS_HOST")]
    pub boskos_host: Option<String>,
    #[arg(long, default_value = DEFAULT_RESOURCE_TYPE)]
    pub boskos_resource_type: String,
    #[arg(long, default_value_t = DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S)]
    pub boskos_acquire_timeout_s: u64,

    /// Creation deadline for leases that do not ask for one; 0 disables it.
    #[arg(long, default_value_t = 3600)]
    pub lease_timeout_s: u64,
    #[arg(long, default_value = "us-west1")]
    pub default_zone: String,
    #[arg(long, default_value = "e2-standard-4")]
    pub default_machine_type: String,
    #[arg(long, default_value_t = 1)]
    pub default_min_nodes: u32,
    #[arg(long, default_value_t = 3)]
    pub default_max_nodes: u32,
}

impl ServerConfig {
    /// A fixed project wins over boskos.
    pub fn resource_pool(&self) -> Result<Arc<dyn ResourcePool>, ServerConfigError> {
        if let Some(project) = self
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|project| !project.is_empty())
        {
            return Ok(Arc::new(StaticProjectPool::new(project)));
        }
        if let Some(host) = self
            .boskos_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
        {
            return Ok(Arc::new(BoskosPool::new(
                host,
                self.boskos_resource_type.clone(),
                Duration::from_secs(self.boskos_acquire_timeout_s),
            )?));
        }
        Err(ServerConfigError::NoResourcePool)
    }

    pub fn base_cluster_config(&self) -> Result<ClusterConfig, ServerConfigError> {
        let mut cfg = match &self.cluster_config {
            Some(path) => ClusterConfig::from_yaml_file(path)?,
            None => ClusterConfig::default(),
        };
        cfg.backup_regions = self
            .backup_regions
            .iter()
            .map(|region| region.trim().to_string())
            .filter(|region| !region.is_empty())
            .collect();
        Ok(cfg)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("work"))
    }

    pub fn version_command(&self) -> Vec<String> {
        self.version_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            zone: self.default_zone.clone(),
            machine_type: self.default_machine_type.clone(),
            min_nodes: self.default_min_nodes,
            max_nodes: self.default_max_nodes,
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            default_timeout: (self.lease_timeout_s > 0)
                .then(|| Duration::from_secs(self.lease_timeout_s)),
            ..AllocatorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["dkcm_server"];
        argv.extend_from_slice(args);
        ServerConfig::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn a_fixed_project_or_boskos_is_required() {
        let cfg = parse(&["--project-id", " "]);
        if cfg.boskos_host.is_none() {
            assert!(matches!(
                cfg.resource_pool(),
                Err(ServerConfigError::NoResourcePool)
            ));
        }
        let cfg = parse(&["--project-id", "my-project"]);
        let pool = cfg.resource_pool().expect("static pool");
        let cancel = std::sync::atomic::AtomicBool::new(false);
        assert_eq!(pool.acquire("job-1", None, &cancel).expect("acquire"), "my-project");

        let cfg = parse(&["--boskos-host", "https://boskos.example.com"]);
        if cfg.project_id.is_none() {
            assert!(cfg.resource_pool().is_ok());
        }
    }

    #[test]
    fn backup_regions_and_timeouts_are_applied() {
        let cfg = parse(&[
            "--backup-regions",
            "europe-west1, ,asia-east1",
            "--lease-timeout-s",
            "0",
            "--work-dir",
            "/tmp/dkcm-work",
        ]);
        let base = cfg.base_cluster_config().expect("base");
        assert_eq!(
            base.backup_regions,
            vec!["europe-west1".to_string(), "asia-east1".to_string()]
        );
        assert_eq!(cfg.allocator_config().default_timeout, None);
        assert_eq!(cfg.work_root(), PathBuf::from("/tmp/dkcm-work"));
    }

    #[test]
    fn version_command_is_split_on_whitespace() {
        let cfg = parse(&[]);
        assert_eq!(cfg.version_command(), vec!["kubectl", "version", "--short=true"]);
        let cfg = parse(&["--version-command", "  echo  v1.30.0 "]);
        assert_eq!(cfg.version_command(), vec!["echo", "v1.30.0"]);
        let cfg = parse(&["--version-command", ""]);
        assert!(cfg.version_command().is_empty());
    }

    #[test]
    fn request_defaults_follow_flags() {
        let cfg = parse(&["--default-zone", "us-east4", "--default-max-nodes", "6"]);
        let defaults = cfg.request_defaults();
        assert_eq!(defaults.zone, "us-east4");
        assert_eq!(defaults.machine_type, "e2-standard-4");
        assert_eq!((defaults.min_nodes, defaults.max_nodes), (1, 6));
    }
}
