#![forbid(unsafe_code)]

/// Lifecycle of a lease. `Ready` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeaseStatus {
    Pending,
    Ready,
    Failed,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Pending => "pending",
            LeaseStatus::Ready => "ready",
            LeaseStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(LeaseStatus::Pending),
            "ready" => Some(LeaseStatus::Ready),
            "failed" => Some(LeaseStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, LeaseStatus::Pending)
    }

    pub fn can_transition_to(self, next: LeaseStatus) -> bool {
        matches!(
            (self, next),
            (LeaseStatus::Pending, LeaseStatus::Ready) | (LeaseStatus::Pending, LeaseStatus::Failed)
        )
    }
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MAX_NODES_LIMIT: u32 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeBounds {
    min: u32,
    max: u32,
}

impl NodeBounds {
    pub fn try_new(min: u32, max: u32) -> Result<Self, ParamsError> {
        if min == 0 {
            return Err(ParamsError::ZeroNodes);
        }
        if min > max {
            return Err(ParamsError::InvertedBounds { min, max });
        }
        if max > MAX_NODES_LIMIT {
            return Err(ParamsError::TooManyNodes { max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// The shape of cluster a caller asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterParams {
    zone: String,
    node_bounds: NodeBounds,
    machine_type: String,
}

impl ClusterParams {
    pub fn try_new(
        zone: impl Into<String>,
        node_bounds: NodeBounds,
        machine_type: impl Into<String>,
    ) -> Result<Self, ParamsError> {
        let zone = zone.into().trim().to_string();
        let machine_type = machine_type.into().trim().to_string();
        validate_token_field(&zone).map_err(ParamsError::Zone)?;
        validate_token_field(&machine_type).map_err(ParamsError::MachineType)?;
        Ok(Self {
            zone,
            node_bounds,
            machine_type,
        })
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn node_bounds(&self) -> NodeBounds {
        self.node_bounds
    }

    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("node count must be at least 1")]
    ZeroNodes,
    #[error("min nodes ({min}) exceeds max nodes ({max})")]
    InvertedBounds { min: u32, max: u32 },
    #[error("max nodes ({max}) exceeds the limit of {limit}", limit = MAX_NODES_LIMIT)]
    TooManyNodes { max: u32 },
    #[error("invalid zone: {0}")]
    Zone(&'static str),
    #[error("invalid machine type: {0}")]
    MachineType(&'static str),
}

// Zone and machine type end up as command-line flag values.
fn validate_token_field(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > 64 {
        return Err("too long");
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err("only ascii letters, digits, '-' and '_' are allowed");
    }
    Ok(())
}
