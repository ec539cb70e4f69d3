#![forbid(unsafe_code)]

//! Regional retry driver: creates a GKE cluster through kubetest2, falling back to backup
//! regions when the primary region reports a stockout.

mod bin_detect;
pub mod classify;
pub mod command;
pub mod config;
pub mod driver;
pub mod executor;
pub mod metadata;

pub use bin_detect::resolve_program;
pub use classify::{FailureClass, classify_failure};
pub use command::{DEFAULT_PROGRAM, ProvisionCommand, RegionAttempt, region_attempts};
pub use config::{
    ClusterConfig, ConfigError, DEFAULT_BOSKOS_ACQUIRE_TIMEOUT_S, ProjectMode, running_in_ci,
};
pub use driver::{ProvisionError, ProvisionSuccess, RegionalRetryDriver, RunOptions};
pub use executor::{CommandExecutor, ExecError, ExecOutput, ExecRequest, ProcessExecutor};
pub use metadata::{JsonFileMetadata, MetadataError, MetadataSink};
