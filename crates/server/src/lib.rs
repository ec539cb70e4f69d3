#![forbid(unsafe_code)]

//! Lease allocator service: hands out e2e GKE clusters to CI jobs and creates them in the
//! background through the regional retry driver.

pub mod allocator;
pub mod config;
pub mod http;
pub mod pool;
pub mod provisioner;
mod support;
mod wire;

pub use allocator::{
    ACQUIRE_DEADLINE_REASON, AllocError, AllocatorConfig, INTERRUPTED_REASON, LeaseAllocator,
    LeaseGrant, LeaseRequest, LeaseView, ReleaseOutcome, generate_unique_id,
};
pub use config::{ServerConfig, ServerConfigError};
pub use http::{RequestDefaults, serve};
pub use pool::{BoskosPool, PoolError, ResourcePool, StaticProjectPool};
pub use provisioner::{
    ClusterProvisioner, ProvisionRequest, ProvisionedCluster, RetryDriverProvisioner,
};
