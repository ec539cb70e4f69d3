#![forbid(unsafe_code)]

pub mod ids;
pub mod model;

pub use ids::{
    ACCESS_TOKEN_LEN, AccessToken, IdError, LEASE_ID_LEN, LeaseId, OwnerId, cluster_name_for,
    random_alphanumeric,
};
pub use model::{ClusterParams, LeaseStatus, NodeBounds, ParamsError};
