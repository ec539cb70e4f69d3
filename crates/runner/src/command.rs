#![forbid(unsafe_code)]

use crate::config::{ClusterConfig, ProjectMode};
use std::fmt;

pub const DEFAULT_PROGRAM: &str = "kubetest2";

const BASE_ARGS: &[&str] = &["gke", "--ignore-gcp-ssh-key=true", "--up"];

/// One region to try. `index` is the position in the de-duplicated region list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionAttempt {
    pub index: usize,
    pub region: String,
}

/// The primary region followed by the backups, duplicates dropped, order kept.
pub fn region_attempts(cfg: &ClusterConfig) -> Vec<RegionAttempt> {
    let mut out: Vec<RegionAttempt> = Vec::with_capacity(1 + cfg.backup_regions.len());
    for region in std::iter::once(&cfg.region).chain(cfg.backup_regions.iter()) {
        let region = region.trim();
        if region.is_empty() || out.iter().any(|attempt| attempt.region == region) {
            continue;
        }
        out.push(RegionAttempt {
            index: out.len(),
            region: region.to_string(),
        });
    }
    out
}

/// The gcloud create command kubetest2 runs for us.
pub fn create_command(cfg: &ClusterConfig) -> String {
    let group = if cfg.command_group.is_empty() {
        String::new()
    } else {
        format!("{} ", cfg.command_group)
    };
    let mut out = format!(
        "{group}container clusters create --quiet --enable-autoscaling --min-nodes={} --max-nodes={} \
         --cluster-version={} --scopes={} --no-enable-autoupgrade",
        cfg.min_nodes, cfg.max_nodes, cfg.version, cfg.scopes
    );
    if !cfg.addons.is_empty() {
        out.push_str(" --addons=");
        out.push_str(&cfg.addons);
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProvisionCommand {
    /// Renders the full argument list for a single attempt. Every attempt starts from scratch.
    pub fn render(
        program: &str,
        cfg: &ClusterConfig,
        project: &ProjectMode,
        attempt: &RegionAttempt,
        test_command: Option<&str>,
    ) -> Self {
        let mut args: Vec<String> = BASE_ARGS.iter().map(|arg| arg.to_string()).collect();
        args.push(format!("--create-command={}", create_command(cfg)));
        args.push(format!("--cluster-name={}", cfg.name));
        args.push(format!("--environment={}", cfg.environment));
        args.push(format!("--num-nodes={}", cfg.min_nodes));
        args.push(format!("--machine-type={}", cfg.machine));
        args.push(format!("--network={}", cfg.network));
        args.push(format!(
            "--enable-workload-identity={}",
            cfg.enable_workload_identity
        ));

        match project {
            ProjectMode::Fixed(project_id) => args.push(format!("--project={project_id}")),
            ProjectMode::Boskos { acquire_timeout_s } => {
                args.push(format!("--boskos-acquire-timeout-seconds={acquire_timeout_s}"))
            }
        }

        args.push(format!("--region={}", attempt.region));

        if !cfg.private_cluster_access_level.is_empty() {
            args.push(format!(
                "--private-cluster-access-level={}",
                cfg.private_cluster_access_level
            ));
            args.push(format!(
                "--private-cluster-master-ip-range={}",
                master_ip_range(&cfg.private_cluster_master_ip_range, attempt.index)
            ));
        }

        if let Some(test_command) = test_command.map(str::trim).filter(|cmd| !cmd.is_empty()) {
            args.push("--test=exec".to_string());
            args.push("--".to_string());
            args.extend(test_command.split_whitespace().map(str::to_string));
        }

        Self {
            program: program.to_string(),
            args,
        }
    }

    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("{flag}=");
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }
}

impl fmt::Display for ProvisionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg:?}")?;
        }
        Ok(())
    }
}

fn master_ip_range(template: &str, index: usize) -> String {
    template.replacen("%d", &index.to_string(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_prefix(cmd: &ProvisionCommand, prefix: &str) -> usize {
        cmd.args.iter().filter(|arg| arg.starts_with(prefix)).count()
    }

    #[test]
    fn region_attempts_drop_duplicates_and_keep_order() {
        let cfg = ClusterConfig {
            region: "us-central1".to_string(),
            backup_regions: vec![
                "us-west1".to_string(),
                "us-central1".to_string(),
                "us-east1".to_string(),
                "us-west1".to_string(),
            ],
            ..ClusterConfig::default()
        };
        let attempts = region_attempts(&cfg);
        let regions: Vec<&str> = attempts.iter().map(|a| a.region.as_str()).collect();
        assert_eq!(regions, vec!["us-central1", "us-west1", "us-east1"]);
        assert_eq!(attempts[2].index, 2);
    }

    #[test]
    fn render_matches_kubetest2_contract() {
        let cfg = ClusterConfig {
            name: "e2e-cls-abc123".to_string(),
            addons: "NodeLocalDNS".to_string(),
            ..ClusterConfig::default()
        };
        let attempt = RegionAttempt {
            index: 0,
            region: "us-central1".to_string(),
        };
        let cmd = ProvisionCommand::render(
            DEFAULT_PROGRAM,
            &cfg,
            &ProjectMode::Fixed("proj-1".to_string()),
            &attempt,
            None,
        );

        assert_eq!(cmd.program, "kubetest2");
        assert_eq!(&cmd.args[..3], &["gke", "--ignore-gcp-ssh-key=true", "--up"]);
        assert_eq!(
            cmd.flag_value("--create-command"),
            Some(
                "beta container clusters create --quiet --enable-autoscaling --min-nodes=1 \
                 --max-nodes=3 --cluster-version=latest --scopes=cloud-platform \
                 --no-enable-autoupgrade --addons=NodeLocalDNS"
            )
        );
        assert_eq!(cmd.flag_value("--cluster-name"), Some("e2e-cls-abc123"));
        assert_eq!(cmd.flag_value("--num-nodes"), Some("1"));
        assert_eq!(cmd.flag_value("--project"), Some("proj-1"));
        assert_eq!(cmd.flag_value("--region"), Some("us-central1"));
        assert_eq!(cmd.flag_value("--enable-workload-identity"), Some("false"));
        assert!(cmd.flag_value("--boskos-acquire-timeout-seconds").is_none());
        assert!(!cmd.args.iter().any(|arg| arg == "--test=exec"));
    }

    #[test]
    fn ga_command_group_has_no_prefix() {
        let cfg = ClusterConfig {
            command_group: String::new(),
            ..ClusterConfig::default()
        };
        assert!(create_command(&cfg).starts_with("container clusters create"));
    }

    #[test]
    fn boskos_mode_and_test_command() {
        let cfg = ClusterConfig::default();
        let attempt = RegionAttempt {
            index: 1,
            region: "us-west1".to_string(),
        };
        let cmd = ProvisionCommand::render(
            "kubetest2",
            &cfg,
            &ProjectMode::Boskos {
                acquire_timeout_s: 1200,
            },
            &attempt,
            Some("  ./test/e2e-tests.sh   --run-tests "),
        );
        assert_eq!(cmd.flag_value("--boskos-acquire-timeout-seconds"), Some("1200"));
        assert!(cmd.flag_value("--project").is_none());
        let tail: Vec<&str> = cmd.args.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["--test=exec", "--", "./test/e2e-tests.sh", "--run-tests"]);
    }

    #[test]
    fn attempts_do_not_accumulate_flags() {
        let cfg = ClusterConfig {
            private_cluster_access_level: "limited".to_string(),
            ..ClusterConfig::default()
        };
        let project = ProjectMode::Fixed("p".to_string());
        for attempt in region_attempts(&cfg) {
            let cmd = ProvisionCommand::render("kubetest2", &cfg, &project, &attempt, Some("go test"));
            assert_eq!(count_prefix(&cmd, "--region="), 1);
            assert_eq!(count_prefix(&cmd, "--private-cluster-access-level="), 1);
            assert_eq!(count_prefix(&cmd, "--private-cluster-master-ip-range="), 1);
            assert_eq!(count_prefix(&cmd, "--test=exec"), 1);
            assert_eq!(cmd.flag_value("--region"), Some(attempt.region.as_str()));
            assert_eq!(
                cmd.flag_value("--private-cluster-master-ip-range").map(str::to_string),
                Some(format!("172.16.0.{}/28", attempt.index))
            );
        }
    }
}
