#![forbid(unsafe_code)]

use dkcm_runner::{
    ClusterConfig, JsonFileMetadata, ProvisionError, RegionalRetryDriver, RunOptions,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub lease_id: String,
    pub cluster_name: String,
    pub project_id: String,
    pub zone: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub machine_type: String,
    pub deadline: Option<Instant>,
    /// Set when the service shuts down; in-flight creation must stop.
    pub cancel: Arc<AtomicBool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedCluster {
    /// Region the cluster ended up in; may be a backup of the requested zone.
    pub region: String,
}

/// Creates one cluster for a lease. Blocks until done, the deadline passes or `cancel` is set.
pub trait ClusterProvisioner: Send + Sync {
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedCluster, ProvisionError>;
}

/// Runs the regional retry driver with the lease's parameters layered over a base config.
/// Attempt logs and `metadata.json` land in `<work_root>/<lease_id>`.
pub struct RetryDriverProvisioner {
    driver: RegionalRetryDriver,
    base: ClusterConfig,
    work_root: PathBuf,
    version_command: Vec<String>,
}

impl RetryDriverProvisioner {
    pub fn new(driver: RegionalRetryDriver, base: ClusterConfig, work_root: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            base,
            work_root: work_root.into(),
            version_command: RunOptions::default().version_command,
        }
    }

    /// Command whose output is recorded as the cluster version. Empty skips it.
    pub fn with_version_command(mut self, version_command: Vec<String>) -> Self {
        self.version_command = version_command;
        self
    }

    pub fn work_dir(&self, lease_id: &str) -> PathBuf {
        self.work_root.join(lease_id)
    }

    pub fn cluster_config(&self, request: &ProvisionRequest) -> ClusterConfig {
        let mut cfg = self.base.clone();
        cfg.name = request.cluster_name.clone();
        cfg.gcp_project_id = Some(request.project_id.clone());
        cfg.region = request.zone.clone();
        cfg.backup_regions.retain(|region| region != &request.zone);
        cfg.machine = request.machine_type.clone();
        cfg.min_nodes = request.min_nodes;
        cfg.max_nodes = request.max_nodes;
        cfg
    }
}

impl ClusterProvisioner for RetryDriverProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedCluster, ProvisionError> {
        let cfg = self.cluster_config(request);
        let work_dir = self.work_dir(&request.lease_id);
        let driver = self
            .driver
            .clone()
            .with_metadata(Arc::new(JsonFileMetadata::in_dir(&work_dir)));
        let opts = RunOptions {
            test_command: None,
            save_metadata: true,
            version_command: self.version_command.clone(),
            work_dir,
            in_ci: false,
            cancel: Some(request.cancel.clone()),
        };
        let done = driver.create_with_fallback(&cfg, &opts, request.deadline)?;
        Ok(ProvisionedCluster {
            region: done.region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dkcm_runner::metadata::{KEY_MACHINE, KEY_REGION, KEY_VERSION};
    use dkcm_runner::{CommandExecutor, ExecError, ExecOutput, ExecRequest, ProcessExecutor};

    fn request(zone: &str) -> ProvisionRequest {
        ProvisionRequest {
            lease_id: "Ab12Cd".to_string(),
            cluster_name: "e2e-cls-ab12cd".to_string(),
            project_id: "knative-boskos-01".to_string(),
            zone: zone.to_string(),
            min_nodes: 2,
            max_nodes: 5,
            machine_type: "n1-standard-8".to_string(),
            deadline: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}_{}_{nonce}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// Every command succeeds and prints a version string.
    struct AlwaysSucceeds;

    impl CommandExecutor for AlwaysSucceeds {
        fn run(&self, _request: ExecRequest<'_>) -> Result<ExecOutput, ExecError> {
            Ok(ExecOutput {
                success: true,
                exit: "0".to_string(),
                output: "v1.30.2-gke.100\n".to_string(),
            })
        }
    }

    #[test]
    fn lease_parameters_override_the_base_config() {
        let base = ClusterConfig {
            backup_regions: vec!["us-west1".to_string(), "us-east1".to_string()],
            ..ClusterConfig::default()
        };
        let provisioner = RetryDriverProvisioner::new(
            RegionalRetryDriver::new("kubetest2", Arc::new(ProcessExecutor::default())),
            base,
            std::env::temp_dir(),
        );

        let cfg = provisioner.cluster_config(&request("us-west1"));
        assert_eq!(cfg.name, "e2e-cls-ab12cd");
        assert_eq!(cfg.gcp_project_id.as_deref(), Some("knative-boskos-01"));
        assert_eq!(cfg.region, "us-west1");
        assert_eq!(cfg.backup_regions, vec!["us-east1".to_string()]);
        assert_eq!(cfg.machine, "n1-standard-8");
        assert_eq!((cfg.min_nodes, cfg.max_nodes), (2, 5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn successful_creation_writes_lease_metadata() {
        let work_root = temp_dir("dkcm_provisioner_metadata");
        let provisioner = RetryDriverProvisioner::new(
            RegionalRetryDriver::new("kubetest2", Arc::new(AlwaysSucceeds)),
            ClusterConfig::default(),
            &work_root,
        );

        let done = provisioner.provision(&request("us-east4")).expect("provision");
        assert_eq!(done.region, "us-east4");

        let metadata = JsonFileMetadata::in_dir(work_root.join("Ab12Cd"));
        assert!(metadata.path().is_file());
        assert_eq!(metadata.get(KEY_REGION).expect("get").as_deref(), Some("us-east4"));
        assert_eq!(metadata.get(KEY_MACHINE).expect("get").as_deref(), Some("n1-standard-8"));
        assert_eq!(
            metadata.get(KEY_VERSION).expect("get").as_deref(),
            Some("v1.30.2-gke.100")
        );
    }
}
