#![forbid(unsafe_code)]

use clap::Parser;
use dkcm_runner::{
    ClusterConfig, DEFAULT_PROGRAM, JsonFileMetadata, ProcessExecutor, RegionalRetryDriver,
    RunOptions, resolve_program, running_in_ci,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// dkcm_runner: create one GKE cluster via kubetest2, falling back to backup regions on stockouts.
#[derive(Parser, Debug)]
#[command(name = "dkcm_runner", about, long_about = None)]
struct Cli {
    /// YAML cluster config; flags below override its values.
    #[arg(long, env = "DKCM_CLUSTER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    gcp_project_id: Option<String>,
    #[arg(long = "boskos-acquire-timeout-seconds")]
    boskos_acquire_timeout_s: Option<u64>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    region: Option<String>,
    /// Comma-separated.
    #[arg(long, value_delimiter = ',')]
    backup_regions: Option<Vec<String>>,
    #[arg(long)]
    machine: Option<String>,
    #[arg(long)]
    min_nodes: Option<u32>,
    #[arg(long)]
    max_nodes: Option<u32>,
    #[arg(long)]
    network: Option<String>,
    #[arg(long = "version")]
    cluster_version: Option<String>,
    #[arg(long)]
    scopes: Option<String>,
    #[arg(long)]
    addons: Option<String>,
    #[arg(long)]
    enable_workload_identity: Option<bool>,
    #[arg(long)]
    environment: Option<String>,
    #[arg(long)]
    command_group: Option<String>,
    #[arg(long)]
    private_cluster_access_level: Option<String>,
    #[arg(long)]
    private_cluster_master_ip_range: Option<String>,

    /// Run after creation as `--test=exec -- <words>`.
    #[arg(long)]
    test_command: Option<String>,
    /// Write metadata.json (CI only).
    #[arg(long = "save-meta-data", default_value_t = true, action = clap::ArgAction::Set)]
    save_metadata: bool,
    /// Where metadata.json is written.
    #[arg(long, env = "ARTIFACTS")]
    artifacts_dir: Option<PathBuf>,
    /// Per-attempt logs.
    #[arg(long, env = "DKCM_WORK_DIR")]
    work_dir: Option<PathBuf>,
    #[arg(long, env = "DKCM_KUBETEST2_BIN", default_value = DEFAULT_PROGRAM)]
    kubetest2_bin: String,
    /// Overall deadline across all regions; 0 disables it.
    #[arg(long, default_value_t = 0)]
    timeout_s: u64,
    /// Print the config that would be used and exit.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn cluster_config(&self) -> Result<ClusterConfig, Box<dyn std::error::Error>> {
        let mut cfg = match &self.config {
            Some(path) => ClusterConfig::from_yaml_file(path)?,
            None => ClusterConfig::default(),
        };

        if let Some(v) = &self.gcp_project_id {
            cfg.gcp_project_id = Some(v.clone());
        }
        if let Some(v) = self.boskos_acquire_timeout_s {
            cfg.boskos_acquire_timeout_s = v;
        }
        if let Some(v) = &self.name {
            cfg.name = v.clone();
        }
        if let Some(v) = &self.region {
            cfg.region = v.clone();
        }
        if let Some(v) = &self.backup_regions {
            cfg.backup_regions = v
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
        if let Some(v) = &self.machine {
            cfg.machine = v.clone();
        }
        if let Some(v) = self.min_nodes {
            cfg.min_nodes = v;
        }
        if let Some(v) = self.max_nodes {
            cfg.max_nodes = v;
        }
        if let Some(v) = &self.network {
            cfg.network = v.clone();
        }
        if let Some(v) = &self.cluster_version {
            cfg.version = v.clone();
        }
        if let Some(v) = &self.scopes {
            cfg.scopes = v.clone();
        }
        if let Some(v) = &self.addons {
            cfg.addons = v.clone();
        }
        if let Some(v) = self.enable_workload_identity {
            cfg.enable_workload_identity = v;
        }
        if let Some(v) = &self.environment {
            cfg.environment = v.clone();
        }
        if let Some(v) = &self.command_group {
            cfg.command_group = v.clone();
        }
        if let Some(v) = &self.private_cluster_access_level {
            cfg.private_cluster_access_level = v.clone();
        }
        if let Some(v) = &self.private_cluster_master_ip_range {
            cfg.private_cluster_master_ip_range = v.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = cli.cluster_config()?;

    if cli.dry_run {
        print!("{}", serde_yaml::to_string(&cfg)?);
        return Ok(());
    }

    let program = resolve_program(&cli.kubetest2_bin)
        .ok_or_else(|| format!("cannot find provisioning program {:?}", cli.kubetest2_bin))?;

    let in_ci = running_in_ci();
    let work_dir = cli
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(format!("dkcm-runner-{}", cfg.name)));
    let opts = RunOptions {
        test_command: cli.test_command.clone(),
        save_metadata: cli.save_metadata && in_ci,
        work_dir,
        in_ci,
        ..RunOptions::default()
    };

    let mut driver = RegionalRetryDriver::new(
        program.to_string_lossy().into_owned(),
        Arc::new(ProcessExecutor::default()),
    );
    if let Some(dir) = &cli.artifacts_dir {
        driver = driver.with_metadata(Arc::new(JsonFileMetadata::in_dir(dir)));
    }

    let deadline = (cli.timeout_s > 0).then(|| Instant::now() + Duration::from_secs(cli.timeout_s));
    match driver.create_with_fallback(&cfg, &opts, deadline) {
        Ok(done) => {
            info!(
                cluster = %cfg.name,
                region = %done.region,
                attempts = done.attempts,
                log = %done.log_path.display(),
                "done"
            );
            Ok(())
        }
        Err(err) => {
            error!(
                cluster = %cfg.name,
                program = driver.program(),
                error = %err,
                "cluster creation failed"
            );
            Err(err.into())
        }
    }
}
