#![forbid(unsafe_code)]

use crate::pool::{PoolError, ResourcePool};
use crate::provisioner::{ClusterProvisioner, ProvisionRequest};
use crate::support::lock;
use dkcm_core::{
    ACCESS_TOKEN_LEN, AccessToken, ClusterParams, LEASE_ID_LEN, LeaseId, LeaseStatus, NodeBounds,
    OwnerId, random_alphanumeric,
};
use dkcm_storage::{
    LeaseColumn, LeaseInsertRequest, LeaseRow, LeasesListRequest, SqliteStore, StoreError, now_ms,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_ID_ATTEMPTS: usize = 16;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
pub const INTERRUPTED_REASON: &str = "interrupted by service restart";
pub const ACQUIRE_DEADLINE_REASON: &str = "deadline exceeded while acquiring a project";

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("no unique {column} after {attempts} attempts")]
    IdExhaustion {
        column: &'static str,
        attempts: usize,
    },
    #[error("unknown access token")]
    InvalidToken,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("lease {lease_id} is still being provisioned")]
    LeaseBusy { lease_id: String },
    #[error("resource pool: {0}")]
    Pool(#[from] PoolError),
    #[error("service is shutting down")]
    ShuttingDown,
}

impl AllocError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::IdExhaustion { .. } => "ID_EXHAUSTION",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::LeaseBusy { .. } => "LEASE_BUSY",
            Self::Pool(_) => "POOL_UNAVAILABLE",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<StoreError> for AllocError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeasePending { lease_id } => Self::LeaseBusy { lease_id },
            StoreError::InvalidInput(message) => Self::InvalidRequest(message.to_string()),
            other => Self::StoreUnavailable(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRequest {
    pub owner_id: String,
    pub zone: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub machine_type: String,
    /// Overrides the allocator's default creation timeout.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub access_token: String,
    pub lease_id: String,
    pub status: LeaseStatus,
    /// The owner already held an outstanding lease and got its token back.
    pub reused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseView {
    Pending,
    Ready {
        cluster_name: String,
        project_id: String,
        zone: String,
        region: String,
    },
    Failed {
        reason: String,
    },
}

impl LeaseView {
    pub fn from_row(row: &LeaseRow) -> Self {
        match row.status {
            LeaseStatus::Pending => Self::Pending,
            LeaseStatus::Ready => Self::Ready {
                cluster_name: row.cluster_name.clone(),
                project_id: row.backing_project_id.clone().unwrap_or_default(),
                zone: row.zone.clone(),
                region: row.region.clone().unwrap_or_else(|| row.zone.clone()),
            },
            LeaseStatus::Failed => Self::Failed {
                reason: row.failure_reason.clone().unwrap_or_default(),
            },
        }
    }

    pub fn status(&self) -> LeaseStatus {
        match self {
            Self::Pending => LeaseStatus::Pending,
            Self::Ready { .. } => LeaseStatus::Ready,
            Self::Failed { .. } => LeaseStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub lease_id: String,
    /// False when the lease had already been released.
    pub released_now: bool,
}

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    pub id_attempts: usize,
    /// Applied when a request carries no timeout of its own. `None` means no deadline.
    pub default_timeout: Option<Duration>,
    /// Upper bound for `wait_lease_status`.
    pub max_wait: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            id_attempts: DEFAULT_ID_ATTEMPTS,
            default_timeout: None,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

pub type IdDraw = dyn Fn(usize) -> String + Send + Sync;

/// Draws candidates until one is absent from `column`, at most `max_attempts` times.
pub fn generate_unique_id(
    store: &SqliteStore,
    column: LeaseColumn,
    len: usize,
    max_attempts: usize,
    draw: &IdDraw,
) -> Result<String, AllocError> {
    for attempt in 1..=max_attempts {
        let candidate = draw(len);
        if candidate.len() != len || !candidate.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            warn!(column = column.as_str(), attempt, "discarding malformed id candidate");
            continue;
        }
        if !store.lease_value_exists(column, &candidate)? {
            return Ok(candidate);
        }
        debug!(column = column.as_str(), attempt, "id collision, drawing again");
    }
    Err(AllocError::IdExhaustion {
        column: column.as_str(),
        attempts: max_attempts,
    })
}

struct Shared {
    store: Arc<Mutex<SqliteStore>>,
    pool: Arc<dyn ResourcePool>,
    provisioner: Arc<dyn ClusterProvisioner>,
    config: AllocatorConfig,
    draw: Arc<IdDraw>,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generation: Mutex<u64>,
    changed: Condvar,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

/// Hands out cluster leases and drives their creation in background threads.
#[derive(Clone)]
pub struct LeaseAllocator {
    shared: Arc<Shared>,
}

impl LeaseAllocator {
    pub fn new(
        store: Arc<Mutex<SqliteStore>>,
        pool: Arc<dyn ResourcePool>,
        provisioner: Arc<dyn ClusterProvisioner>,
        config: AllocatorConfig,
    ) -> Self {
        Self::with_id_draw(store, pool, provisioner, config, Arc::new(random_alphanumeric))
    }

    pub fn with_id_draw(
        store: Arc<Mutex<SqliteStore>>,
        pool: Arc<dyn ResourcePool>,
        provisioner: Arc<dyn ClusterProvisioner>,
        config: AllocatorConfig,
        draw: Arc<IdDraw>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                pool,
                provisioner,
                config,
                draw,
                owner_locks: Mutex::new(HashMap::new()),
                generation: Mutex::new(0),
                changed: Condvar::new(),
                tasks: Mutex::new(Vec::new()),
                shutdown: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn request_lease(&self, request: LeaseRequest) -> Result<LeaseGrant, AllocError> {
        let owner = OwnerId::try_new(request.owner_id)
            .map_err(|err| AllocError::InvalidRequest(format!("owner_id: {err}")))?;
        let bounds = NodeBounds::try_new(request.min_nodes, request.max_nodes)
            .map_err(|err| AllocError::InvalidRequest(err.to_string()))?;
        let params = ClusterParams::try_new(request.zone, bounds, request.machine_type)
            .map_err(|err| AllocError::InvalidRequest(err.to_string()))?;
        let timeout = request.timeout.or(self.shared.config.default_timeout);
        if self.is_shutting_down() {
            return Err(AllocError::ShuttingDown);
        }

        self.with_owner_lock(owner.as_str().to_string(), || {
            self.request_lease_locked(owner, params, timeout)
        })
    }

    fn request_lease_locked(
        &self,
        owner: OwnerId,
        params: ClusterParams,
        timeout: Option<Duration>,
    ) -> Result<LeaseGrant, AllocError> {
        let shared = &self.shared;
        let row = {
            let mut store = lock(&shared.store);
            if let Some(existing) = store.lease_find_outstanding(owner.as_str())? {
                info!(
                    owner = %owner,
                    lease = %existing.lease_id,
                    status = %existing.status,
                    "owner already holds a lease, returning it"
                );
                return Ok(LeaseGrant {
                    access_token: existing.access_token,
                    lease_id: existing.lease_id,
                    status: existing.status,
                    reused: true,
                });
            }

            let attempts = shared.config.id_attempts;
            let lease_id = generate_unique_id(
                &store,
                LeaseColumn::LeaseId,
                LEASE_ID_LEN,
                attempts,
                shared.draw.as_ref(),
            )?;
            let access_token = generate_unique_id(
                &store,
                LeaseColumn::AccessToken,
                ACCESS_TOKEN_LEN,
                attempts,
                shared.draw.as_ref(),
            )?;
            let lease_id = LeaseId::try_new(lease_id).map_err(|_| AllocError::IdExhaustion {
                column: LeaseColumn::LeaseId.as_str(),
                attempts,
            })?;
            let access_token =
                AccessToken::try_new(access_token).map_err(|_| AllocError::IdExhaustion {
                    column: LeaseColumn::AccessToken.as_str(),
                    attempts,
                })?;

            let deadline_ms = timeout.map(|timeout| {
                let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
                now_ms().saturating_add(millis)
            });
            store.lease_insert(LeaseInsertRequest {
                lease_id,
                access_token,
                owner_id: owner,
                params,
                deadline_ms,
            })?
        };

        info!(
            owner = %row.owner_id,
            lease = %row.lease_id,
            zone = %row.zone,
            machine = %row.machine_type,
            min_nodes = row.min_nodes,
            max_nodes = row.max_nodes,
            "lease created, starting cluster creation"
        );

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let task_shared = self.shared.clone();
        let task_row = row.clone();
        let handle = std::thread::spawn(move || run_creation(&task_shared, task_row, deadline));
        {
            let mut tasks = lock(&shared.tasks);
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }

        Ok(LeaseGrant {
            access_token: row.access_token,
            lease_id: row.lease_id,
            status: row.status,
            reused: false,
        })
    }

    pub fn query_lease_status(&self, access_token: &str) -> Result<LeaseView, AllocError> {
        let row = self.lease_by_token(access_token)?;
        Ok(LeaseView::from_row(&row))
    }

    /// Blocks until the lease leaves `pending` or `max_wait` (capped) runs out.
    pub fn wait_lease_status(
        &self,
        access_token: &str,
        max_wait: Duration,
    ) -> Result<LeaseView, AllocError> {
        let until = Instant::now() + max_wait.min(self.shared.config.max_wait);
        loop {
            let seen = *lock(&self.shared.generation);
            let view = self.query_lease_status(access_token)?;
            let now = Instant::now();
            if view != LeaseView::Pending || now >= until {
                return Ok(view);
            }

            let generation = lock(&self.shared.generation);
            if *generation != seen {
                continue;
            }
            let _ = self
                .shared
                .changed
                .wait_timeout(generation, until - now)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Returns the backing project to the pool and stamps the lease released.
    pub fn release_lease(&self, access_token: &str) -> Result<ReleaseOutcome, AllocError> {
        let row = self.lease_by_token(access_token)?;
        let owner = row.owner_id.clone();
        self.with_owner_lock(owner, || {
            let row = {
                let store = lock(&self.shared.store);
                store
                    .lease_get(&row.lease_id)?
                    .ok_or(AllocError::InvalidToken)?
            };
            if row.status == LeaseStatus::Pending {
                return Err(AllocError::LeaseBusy {
                    lease_id: row.lease_id,
                });
            }
            if row.is_released() {
                return Ok(ReleaseOutcome {
                    lease_id: row.lease_id,
                    released_now: false,
                });
            }

            // Failed leases gave their project back when they failed.
            if row.status == LeaseStatus::Ready {
                if let Some(project) = &row.backing_project_id {
                    self.shared.pool.release(project, &row.owner_id)?;
                }
            }

            let (row, released_now) = lock(&self.shared.store).lease_release(&row.lease_id)?;
            info!(lease = %row.lease_id, owner = %row.owner_id, "lease released");
            self.shared.notify();
            Ok(ReleaseOutcome {
                lease_id: row.lease_id,
                released_now,
            })
        })
    }

    /// Fails every lease a previous process left pending. Run before serving requests.
    pub fn recover_interrupted(&self) -> Result<usize, AllocError> {
        let pending = lock(&self.shared.store).leases_pending()?;
        let mut recovered = 0;
        for row in pending {
            let marked = lock(&self.shared.store).lease_mark_failed(&row.lease_id, INTERRUPTED_REASON);
            match marked {
                Ok(_) => {
                    recovered += 1;
                    warn!(lease = %row.lease_id, owner = %row.owner_id, "pending lease failed after restart");
                    if let Some(project) = &row.backing_project_id {
                        if let Err(err) = self.shared.pool.release(project, &row.owner_id) {
                            warn!(lease = %row.lease_id, project = %project, error = %err, "failed to release project");
                        }
                    }
                }
                Err(err) => {
                    warn!(lease = %row.lease_id, error = %err, "could not fail interrupted lease")
                }
            }
        }
        if recovered > 0 {
            self.shared.notify();
        }
        Ok(recovered)
    }

    pub fn list_leases(&self, request: LeasesListRequest) -> Result<Vec<LeaseRow>, AllocError> {
        Ok(lock(&self.shared.store).leases_list(request)?)
    }

    /// Refuses new leases and stops in-flight creation: pool waits end and provisioning
    /// process groups are terminated. Their leases fail and return their projects.
    /// Follow with `wait_idle`.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::SeqCst) {
            info!("allocator shutting down");
        }
        self.shared.notify();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Joins every creation task started so far.
    pub fn wait_idle(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.shared.tasks));
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if task.join().is_err() {
                    error!("cluster creation task panicked");
                }
            }
        }
    }

    fn lease_by_token(&self, access_token: &str) -> Result<LeaseRow, AllocError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(AllocError::InvalidToken);
        }
        lock(&self.shared.store)
            .lease_get_by_token(access_token)?
            .ok_or(AllocError::InvalidToken)
    }

    fn with_owner_lock<R>(&self, owner: String, f: impl FnOnce() -> R) -> R {
        let owner_lock = lock(&self.shared.owner_locks)
            .entry(owner.clone())
            .or_default()
            .clone();
        let result = {
            let _held = lock(&owner_lock);
            f()
        };

        let mut locks = lock(&self.shared.owner_locks);
        // Only the map and this call hold it: nobody else is waiting.
        if Arc::strong_count(&owner_lock) == 2 {
            locks.remove(&owner);
        }
        result
    }
}

impl Shared {
    fn notify(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn fail_lease(&self, row: &LeaseRow, reason: &str, project: Option<&str>) {
        match lock(&self.store).lease_mark_failed(&row.lease_id, reason) {
            Ok(_) => error!(lease = %row.lease_id, owner = %row.owner_id, reason, "lease failed"),
            Err(err) => {
                error!(lease = %row.lease_id, error = %err, reason, "could not record lease failure")
            }
        }
        if let Some(project) = project {
            if let Err(err) = self.pool.release(project, &row.owner_id) {
                warn!(lease = %row.lease_id, project, error = %err, "failed to release project");
            }
        }
        self.notify();
    }
}

fn run_creation(shared: &Shared, row: LeaseRow, deadline: Option<Instant>) {
    let acquired = shared.pool.acquire(&row.owner_id, deadline, &shared.shutdown);
    let project = match acquired {
        Ok(project) => project,
        Err(err) => {
            shared.fail_lease(&row, &format!("acquire project: {err}"), None);
            return;
        }
    };
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        shared.fail_lease(&row, ACQUIRE_DEADLINE_REASON, Some(&project));
        return;
    }
    let attached = lock(&shared.store).lease_set_backing_project(&row.lease_id, &project);
    if let Err(err) = attached {
        shared.fail_lease(&row, &format!("record project: {err}"), Some(&project));
        return;
    }
    info!(lease = %row.lease_id, project = %project, "project acquired, creating cluster");

    let request = ProvisionRequest {
        lease_id: row.lease_id.clone(),
        cluster_name: row.cluster_name.clone(),
        project_id: project.clone(),
        zone: row.zone.clone(),
        min_nodes: row.min_nodes,
        max_nodes: row.max_nodes,
        machine_type: row.machine_type.clone(),
        deadline,
        cancel: shared.shutdown.clone(),
    };
    let cluster = match shared.provisioner.provision(&request) {
        Ok(cluster) => cluster,
        Err(err) => {
            shared.fail_lease(&row, &err.to_string(), Some(&project));
            return;
        }
    };

    let mut marked = lock(&shared.store).lease_mark_ready(&row.lease_id, &cluster.region);
    if let Err(err) = &marked {
        warn!(lease = %row.lease_id, error = %err, "could not mark lease ready, retrying once");
        marked = lock(&shared.store).lease_mark_ready(&row.lease_id, &cluster.region);
    }
    match marked {
        Ok(_) => {
            info!(lease = %row.lease_id, region = %cluster.region, "cluster ready");
            shared.notify();
        }
        // The cluster exists but the lease cannot say so; the project goes back dirty.
        Err(err) => shared.fail_lease(&row, &format!("record ready cluster: {err}"), Some(&project)),
    }
}
