#![forbid(unsafe_code)]

use crate::classify::{FailureClass, classify_failure};
use crate::command::{ProvisionCommand, region_attempts};
use crate::config::{ClusterConfig, ConfigError};
use crate::executor::{
    CommandExecutor, ExecError, ExecOutput, ExecRequest, attempt_log_path, output_tail,
};
use crate::metadata::{
    KEY_MACHINE, KEY_MAX_NODES, KEY_MIN_NODES, KEY_PROVIDER, KEY_REGION, KEY_VERSION,
    MetadataSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const ERROR_TAIL_CHARS: usize = 1_500;
const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Passed to kubetest2 as `--test=exec -- <words>`.
    pub test_command: Option<String>,
    pub save_metadata: bool,
    /// Run after a successful create; its output becomes `E2E:Version`.
    pub version_command: Vec<String>,
    /// Per-attempt output logs land here.
    pub work_dir: PathBuf,
    /// Allows kubetest2 to acquire a boskos project when none is configured.
    pub in_ci: bool,
    /// Shared stop flag; once set, the running attempt is terminated and no other starts.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_deref()
            .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            test_command: None,
            save_metadata: true,
            version_command: vec![
                "kubectl".to_string(),
                "version".to_string(),
                "--short=true".to_string(),
            ],
            work_dir: std::env::temp_dir().join("dkcm-runner"),
            in_ci: false,
            cancel: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisionSuccess {
    pub region: String,
    pub output: String,
    /// Number of regions tried, the successful one included.
    pub attempts: usize,
    pub log_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid cluster config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("cluster creation failed in {region} (exit {exit}): {output_tail}")]
    Fatal {
        region: String,
        exit: String,
        output_tail: String,
    },
    #[error("cluster creation failed in all {attempts} regions, last in {region}: {output_tail}")]
    RegionsExhausted {
        attempts: usize,
        region: String,
        output_tail: String,
    },
    #[error("deadline exceeded while creating the cluster in {region}")]
    DeadlineExceeded { region: String },
    #[error("cluster creation in {region} interrupted by service shutdown")]
    Cancelled { region: String },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("work dir {path}: {source}")]
    WorkDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Creates a cluster in the primary region, moving through the backups only on transient failures.
#[derive(Clone)]
pub struct RegionalRetryDriver {
    program: String,
    executor: Arc<dyn CommandExecutor>,
    metadata: Option<Arc<dyn MetadataSink>>,
}

impl RegionalRetryDriver {
    pub fn new(program: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            program: program.into(),
            executor,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.metadata = Some(sink);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn create_with_fallback(
        &self,
        cfg: &ClusterConfig,
        opts: &RunOptions,
        deadline: Option<Instant>,
    ) -> Result<ProvisionSuccess, ProvisionError> {
        cfg.validate()?;
        let project = cfg.project_mode(opts.in_ci)?;
        let attempts = region_attempts(cfg);

        std::fs::create_dir_all(&opts.work_dir).map_err(|source| ProvisionError::WorkDir {
            path: opts.work_dir.display().to_string(),
            source,
        })?;

        let mut last_failure: Option<(String, ExecOutput)> = None;
        for attempt in &attempts {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ProvisionError::DeadlineExceeded {
                    region: attempt.region.clone(),
                });
            }
            if opts.cancelled() {
                return Err(ProvisionError::Cancelled {
                    region: attempt.region.clone(),
                });
            }

            let command = ProvisionCommand::render(
                &self.program,
                cfg,
                &project,
                attempt,
                opts.test_command.as_deref(),
            );
            let log_path = attempt_log_path(&opts.work_dir, attempt.index, &attempt.region);
            info!(
                cluster = %cfg.name,
                attempt = attempt.index,
                region = %attempt.region,
                command = %command,
                "creating cluster"
            );

            let out = match self.executor.run(ExecRequest {
                command: &command,
                log_path: &log_path,
                deadline,
                cancel: opts.cancel.as_deref(),
            }) {
                Ok(out) => out,
                Err(ExecError::DeadlineExceeded { .. }) => {
                    error!(cluster = %cfg.name, region = %attempt.region, "deadline exceeded, process terminated");
                    return Err(ProvisionError::DeadlineExceeded {
                        region: attempt.region.clone(),
                    });
                }
                Err(ExecError::Cancelled { .. }) => {
                    warn!(cluster = %cfg.name, region = %attempt.region, "shutting down, process terminated");
                    return Err(ProvisionError::Cancelled {
                        region: attempt.region.clone(),
                    });
                }
                Err(ExecError::Spawn { program, source }) => {
                    return Err(ProvisionError::Spawn { program, source });
                }
                Err(ExecError::Capture { path, source }) => {
                    return Err(ProvisionError::WorkDir { path, source });
                }
            };

            if out.success {
                info!(cluster = %cfg.name, region = %attempt.region, attempts = attempt.index + 1, "cluster created");
                if opts.save_metadata {
                    self.save_metadata(cfg, &attempt.region, opts, deadline);
                }
                return Ok(ProvisionSuccess {
                    region: attempt.region.clone(),
                    output: out.output,
                    attempts: attempt.index + 1,
                    log_path,
                });
            }

            let class = classify_failure(&out.output);
            match class {
                FailureClass::Transient => {
                    warn!(
                        cluster = %cfg.name,
                        region = %attempt.region,
                        exit = %out.exit,
                        class = class.as_str(),
                        log = %log_path.display(),
                        "transient creation failure, trying the next region"
                    );
                    last_failure = Some((attempt.region.clone(), out));
                }
                FailureClass::Fatal => {
                    error!(
                        cluster = %cfg.name,
                        region = %attempt.region,
                        exit = %out.exit,
                        class = class.as_str(),
                        log = %log_path.display(),
                        "cluster creation failed"
                    );
                    return Err(ProvisionError::Fatal {
                        region: attempt.region.clone(),
                        exit: out.exit,
                        output_tail: output_tail(&out.output, ERROR_TAIL_CHARS),
                    });
                }
            }
        }

        match last_failure {
            Some((region, out)) => Err(ProvisionError::RegionsExhausted {
                attempts: attempts.len(),
                region,
                output_tail: output_tail(&out.output, ERROR_TAIL_CHARS),
            }),
            None => Err(ProvisionError::InvalidConfig(ConfigError::Invalid {
                field: "region",
                reason: "no regions to try".to_string(),
            })),
        }
    }

    // Best effort: a metadata problem never fails an already created cluster.
    fn save_metadata(
        &self,
        cfg: &ClusterConfig,
        region: &str,
        opts: &RunOptions,
        deadline: Option<Instant>,
    ) {
        let Some(sink) = &self.metadata else {
            debug!("no metadata sink configured");
            return;
        };

        let mut entries = vec![
            (KEY_PROVIDER, "gke".to_string()),
            (KEY_REGION, region.to_string()),
            (KEY_MACHINE, cfg.machine.clone()),
            (KEY_MIN_NODES, cfg.min_nodes.to_string()),
            (KEY_MAX_NODES, cfg.max_nodes.to_string()),
        ];
        match self.read_version(opts, deadline) {
            Some(version) => entries.push((KEY_VERSION, version)),
            None => warn!("cluster version unavailable, E2E:Version not recorded"),
        }

        for (key, value) in entries {
            if let Err(err) = sink.set(key, &value) {
                warn!(key, error = %err, "failed to record metadata");
            }
        }
    }

    fn read_version(&self, opts: &RunOptions, deadline: Option<Instant>) -> Option<String> {
        let (program, args) = opts.version_command.split_first()?;
        let command = ProvisionCommand {
            program: program.clone(),
            args: args.to_vec(),
        };
        let version_deadline = Instant::now() + VERSION_TIMEOUT;
        let deadline = deadline.map_or(version_deadline, |d| d.min(version_deadline));
        match self.executor.run(ExecRequest {
            command: &command,
            log_path: &opts.work_dir.join("version.log"),
            deadline: Some(deadline),
            cancel: opts.cancel.as_deref(),
        }) {
            Ok(out) if out.success => Some(out.output.trim().to_string()),
            Ok(out) => {
                warn!(exit = %out.exit, "version command failed");
                None
            }
            Err(err) => {
                warn!(error = %err, "version command failed");
                None
            }
        }
    }
}
