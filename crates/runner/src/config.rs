#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S: u64 = 1200;
pub const DEFAULT_MASTER_IP_RANGE: &str = "172.16.0.%d/28";

const ENVIRONMENTS: &[&str] = &["prod", "staging", "staging2", "test"];
const COMMAND_GROUPS: &[&str] = &["alpha", "beta", ""];
const ACCESS_LEVELS: &[&str] = &["no", "limited", "unrestricted"];
const MAX_FIELD_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Everything needed to create one GKE cluster through kubetest2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    pub gcp_project_id: Option<String>,
    pub boskos_acquire_timeout_s: u64,
    pub name: String,
    pub region: String,
    pub backup_regions: Vec<String>,
    pub machine: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub network: String,
    pub version: String,
    pub scopes: String,
    pub addons: String,
    pub enable_workload_identity: bool,
    pub environment: String,
    pub command_group: String,
    /// Empty disables private cluster flags.
    pub private_cluster_access_level: String,
    /// Must contain exactly one `%d`; it is replaced by the attempt index.
    pub private_cluster_master_ip_range: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            gcp_project_id: None,
            boskos_acquire_timeout_s: DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S,
            name: "e2e-cls".to_string(),
            region: "us-central1".to_string(),
            backup_regions: vec!["us-west1".to_string(), "us-east1".to_string()],
            machine: "e2-standard-4".to_string(),
            min_nodes: 1,
            max_nodes: 3,
            network: "e2e-network".to_string(),
            version: "latest".to_string(),
            scopes: "cloud-platform".to_string(),
            addons: String::new(),
            enable_workload_identity: false,
            environment: "prod".to_string(),
            command_group: "beta".to_string(),
            private_cluster_access_level: String::new(),
            private_cluster_master_ip_range: DEFAULT_MASTER_IP_RANGE.to_string(),
        }
    }
}

/// Where the GCP project for the cluster comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProjectMode {
    Fixed(String),
    /// kubetest2 acquires a project from boskos itself.
    Boskos { acquire_timeout_s: u64 },
}

impl ClusterConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_token("name", &self.name)?;
        check_token("region", &self.region)?;
        for region in &self.backup_regions {
            check_token("backup_regions", region)?;
        }
        check_token("machine", &self.machine)?;
        check_token("network", &self.network)?;
        check_token("version", &self.version)?;
        check_list("scopes", &self.scopes, false)?;
        check_list("addons", &self.addons, true)?;

        if self.min_nodes == 0 {
            return Err(invalid("min_nodes", "must be at least 1"));
        }
        if self.min_nodes > self.max_nodes {
            return Err(invalid(
                "max_nodes",
                format!("{} is below min_nodes {}", self.max_nodes, self.min_nodes),
            ));
        }
        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            return Err(invalid(
                "environment",
                format!("{:?} is not one of {ENVIRONMENTS:?}", self.environment),
            ));
        }
        if !COMMAND_GROUPS.contains(&self.command_group.as_str()) {
            return Err(invalid(
                "command_group",
                format!("{:?} must be alpha, beta or empty", self.command_group),
            ));
        }
        if !self.private_cluster_access_level.is_empty() {
            if !ACCESS_LEVELS.contains(&self.private_cluster_access_level.as_str()) {
                return Err(invalid(
                    "private_cluster_access_level",
                    format!(
                        "{:?} is not one of {ACCESS_LEVELS:?}",
                        self.private_cluster_access_level
                    ),
                ));
            }
            if self.private_cluster_master_ip_range.matches("%d").count() != 1 {
                return Err(invalid(
                    "private_cluster_master_ip_range",
                    "must contain exactly one %d placeholder",
                ));
            }
        }
        if let Some(project) = &self.gcp_project_id {
            check_token("gcp_project_id", project)?;
        }
        Ok(())
    }

    /// A configured project always wins. Without one, only CI may fall back to boskos.
    pub fn project_mode(&self, in_ci: bool) -> Result<ProjectMode, ConfigError> {
        match self.gcp_project_id.as_deref().map(str::trim) {
            Some(project) if !project.is_empty() => Ok(ProjectMode::Fixed(project.to_string())),
            _ if in_ci => Ok(ProjectMode::Boskos {
                acquire_timeout_s: if self.boskos_acquire_timeout_s == 0 {
                    DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S
                } else {
                    self.boskos_acquire_timeout_s
                },
            }),
            _ => Err(invalid(
                "gcp_project_id",
                "a GCP project must be provided outside CI",
            )),
        }
    }
}

// Values end up as `--flag=value` arguments, so whitespace and shell-ish characters are refused.
fn check_token(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(invalid(field, "is too long"));
    }
    if let Some(ch) = value
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
    {
        return Err(invalid(field, format!("contains {ch:?}")));
    }
    Ok(())
}

fn check_list(field: &'static str, value: &str, allow_empty: bool) -> Result<(), ConfigError> {
    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err(invalid(field, "must not be empty"))
        };
    }
    for item in value.split(',') {
        check_token(field, item)?;
    }
    Ok(())
}

/// Prow sets `CI=true` for every job.
pub fn running_in_ci() -> bool {
    std::env::var("CI")
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ClusterConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn yaml_overlays_defaults() {
        let cfg = ClusterConfig::from_yaml_str(
            "region: europe-west1\nbackup_regions: [europe-west4]\nmax_nodes: 5\n",
        )
        .expect("parse yaml");
        assert_eq!(cfg.region, "europe-west1");
        assert_eq!(cfg.backup_regions, vec!["europe-west4".to_string()]);
        assert_eq!(cfg.max_nodes, 5);
        assert_eq!(cfg.machine, "e2-standard-4");
        assert_eq!(cfg.min_nodes, 1);
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        let err = ClusterConfig::from_yaml_str("regoin: us-east1\n").expect_err("typo");
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = ClusterConfig {
            environment: "qa".to_string(),
            ..ClusterConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "environment", .. })
        ));

        cfg = ClusterConfig {
            command_group: "ga".to_string(),
            ..ClusterConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg = ClusterConfig {
            min_nodes: 4,
            max_nodes: 2,
            ..ClusterConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg = ClusterConfig {
            private_cluster_access_level: "limited".to_string(),
            private_cluster_master_ip_range: "172.16.0.0/28".to_string(),
            ..ClusterConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "private_cluster_master_ip_range",
                ..
            })
        ));

        cfg = ClusterConfig {
            region: "us-west1 --project=evil".to_string(),
            ..ClusterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn project_mode_prefers_explicit_project() {
        let cfg = ClusterConfig {
            gcp_project_id: Some("knative-e2e".to_string()),
            ..ClusterConfig::default()
        };
        assert_eq!(
            cfg.project_mode(true).expect("mode"),
            ProjectMode::Fixed("knative-e2e".to_string())
        );

        let cfg = ClusterConfig {
            boskos_acquire_timeout_s: 0,
            ..ClusterConfig::default()
        };
        assert_eq!(
            cfg.project_mode(true).expect("mode"),
            ProjectMode::Boskos {
                acquire_timeout_s: DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S
            }
        );
        assert!(cfg.project_mode(false).is_err());
    }
}
