#![forbid(unsafe_code)]

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_RESOURCE_TYPE: &str = "gke-project";

const IO_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("resource pool unreachable: {0}")]
    Transport(String),
    #[error("resource pool returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("no {resource_type} became free within {waited_s}s")]
    Exhausted { resource_type: String, waited_s: u64 },
    #[error("deadline exceeded after waiting {waited_s}s for a {resource_type}")]
    DeadlineExceeded { resource_type: String, waited_s: u64 },
    #[error("interrupted by service shutdown")]
    Cancelled,
    #[error("resource pool protocol: {0}")]
    Protocol(String),
}

impl From<ureq::Error> for PoolError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => Self::Http {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => Self::Transport(transport.to_string()),
        }
    }
}

/// Hands out scarce cloud projects. `owner` is recorded by the pool for bookkeeping.
pub trait ResourcePool: Send + Sync {
    /// Blocks until a project is free. Gives up once `deadline` passes or `cancel` is set.
    fn acquire(
        &self,
        owner: &str,
        deadline: Option<Instant>,
        cancel: &AtomicBool,
    ) -> Result<String, PoolError>;
    fn release(&self, project_id: &str, owner: &str) -> Result<(), PoolError>;
}

/// Every lease gets the same project. For running outside CI.
#[derive(Clone, Debug)]
pub struct StaticProjectPool {
    project_id: String,
}

impl StaticProjectPool {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}

impl ResourcePool for StaticProjectPool {
    fn acquire(
        &self,
        _owner: &str,
        _deadline: Option<Instant>,
        _cancel: &AtomicBool,
    ) -> Result<String, PoolError> {
        Ok(self.project_id.clone())
    }

    fn release(&self, _project_id: &str, _owner: &str) -> Result<(), PoolError> {
        Ok(())
    }
}

/// Boskos: `free -> busy` on acquire, `busy -> dirty` on release.
#[derive(Clone)]
pub struct BoskosPool {
    agent: ureq::Agent,
    base_url: String,
    resource_type: String,
    acquire_timeout: Duration,
}

impl BoskosPool {
    /// `endpoint` is `host[:port]` or a full `http://` / `https://` URL.
    pub fn new(
        endpoint: &str,
        resource_type: impl Into<String>,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(IO_TIMEOUT).build(),
            base_url: base_url(endpoint)?,
            resource_type: resource_type.into(),
            acquire_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn try_acquire(&self, owner: &str) -> Result<Option<String>, PoolError> {
        let response = self
            .agent
            .post(&format!("{}/acquire", self.base_url))
            .query("type", &self.resource_type)
            .query("state", "free")
            .query("dest", "busy")
            .query("owner", owner)
            .call();
        let payload: Value = match response {
            Ok(response) => response
                .into_json()
                .map_err(|err| PoolError::Protocol(format!("acquire response: {err}")))?,
            // Boskos answers 404 while every resource of the type is taken.
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PoolError::Protocol("acquire response has no name".to_string()))?;
        Ok(Some(name.to_string()))
    }
}

impl ResourcePool for BoskosPool {
    fn acquire(
        &self,
        owner: &str,
        deadline: Option<Instant>,
        cancel: &AtomicBool,
    ) -> Result<String, PoolError> {
        let started = Instant::now();
        let timeout_at = started + self.acquire_timeout;
        let give_up_at = deadline.map_or(timeout_at, |deadline| deadline.min(timeout_at));
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(PoolError::Cancelled);
            }
            if let Some(name) = self.try_acquire(owner)? {
                info!(project = %name, owner, "acquired project from boskos");
                return Ok(name);
            }

            let now = Instant::now();
            if now >= give_up_at {
                let resource_type = self.resource_type.clone();
                let waited_s = now.duration_since(started).as_secs();
                return Err(if give_up_at < timeout_at {
                    PoolError::DeadlineExceeded {
                        resource_type,
                        waited_s,
                    }
                } else {
                    PoolError::Exhausted {
                        resource_type,
                        waited_s,
                    }
                });
            }
            let sleep_for = backoff.min(give_up_at - now);
            debug!(owner, sleep_ms = sleep_for.as_millis() as u64, "no free project, retrying");
            sleep_unless_cancelled(sleep_for, cancel);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn release(&self, project_id: &str, owner: &str) -> Result<(), PoolError> {
        let released = self
            .agent
            .post(&format!("{}/release", self.base_url))
            .query("name", project_id)
            .query("dest", "dirty")
            .query("owner", owner)
            .call();
        if let Err(err) = released {
            let err = PoolError::from(err);
            warn!(project = %project_id, error = %err, "boskos release rejected");
            return Err(err);
        }
        Ok(())
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) {
    let until = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= until || cancel.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(CANCEL_POLL.min(until - now));
    }
}

fn base_url(endpoint: &str) -> Result<String, PoolError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let (scheme, authority) = match trimmed.split_once("://") {
        Some((scheme, rest)) if scheme == "http" || scheme == "https" => (scheme, rest),
        Some((scheme, _)) => {
            return Err(PoolError::Protocol(format!(
                "unsupported scheme {scheme:?} in {endpoint:?}"
            )));
        }
        None => ("http", trimmed),
    };
    if authority.is_empty() || authority.contains(['/', '?', '#']) {
        return Err(PoolError::Protocol(format!("invalid endpoint {endpoint:?}")));
    }
    Ok(format!("{scheme}://{authority}"))
}
