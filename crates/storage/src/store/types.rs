#![forbid(unsafe_code)]

use dkcm_core::LeaseStatus;

#[derive(Clone, Debug)]
pub struct LeaseRow {
    pub lease_id: String,
    pub access_token: String,
    pub owner_id: String,
    pub backing_project_id: Option<String>,
    pub status: LeaseStatus,
    pub zone: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub machine_type: String,
    pub cluster_name: String,
    /// Region the cluster was actually created in (after any fallback).
    pub region: Option<String>,
    pub failure_reason: Option<String>,
    pub deadline_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub released_at_ms: Option<i64>,
}

impl LeaseRow {
    pub fn is_released(&self) -> bool {
        self.released_at_ms.is_some()
    }

    pub fn is_outstanding(&self) -> bool {
        self.status != LeaseStatus::Failed && !self.is_released()
    }
}
