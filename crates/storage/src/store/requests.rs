#![forbid(unsafe_code)]

use dkcm_core::{AccessToken, ClusterParams, LeaseId, LeaseStatus, OwnerId};

#[derive(Clone, Debug)]
pub struct LeaseInsertRequest {
    pub lease_id: LeaseId,
    pub access_token: AccessToken,
    pub owner_id: OwnerId,
    pub params: ClusterParams,
    pub deadline_ms: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct LeasesListRequest {
    pub status: Option<LeaseStatus>,
    pub owner_id: Option<String>,
    pub limit: usize,
}

/// Columns that hold generated identifiers and must stay unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseColumn {
    LeaseId,
    AccessToken,
}

impl LeaseColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseColumn::LeaseId => "lease_id",
            LeaseColumn::AccessToken => "access_token",
        }
    }
}
