#![forbid(unsafe_code)]

use super::*;
use dkcm_core::{LeaseStatus, cluster_name_for};
use rusqlite::Transaction;

const MAX_LIST_LIMIT: usize = 200;
const MAX_PROJECT_ID_LEN: usize = 128;
const MAX_FAILURE_REASON_LEN: usize = 2_000;

const LEASE_COLUMNS: &str = "lease_id, access_token, owner_id, backing_project_id, status, zone, \
     min_nodes, max_nodes, machine_type, cluster_name, region, failure_reason, deadline_ms, \
     created_at_ms, updated_at_ms, released_at_ms";

fn read_lease_row(row: &rusqlite::Row<'_>) -> Result<LeaseRow, rusqlite::Error> {
    let raw_status: String = row.get(4)?;
    let status = LeaseStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown lease status {raw_status:?}").into(),
        )
    })?;
    Ok(LeaseRow {
        lease_id: row.get(0)?,
        access_token: row.get(1)?,
        owner_id: row.get(2)?,
        backing_project_id: row.get(3)?,
        status,
        zone: row.get(5)?,
        min_nodes: row.get(6)?,
        max_nodes: row.get(7)?,
        machine_type: row.get(8)?,
        cluster_name: row.get(9)?,
        region: row.get(10)?,
        failure_reason: row.get(11)?,
        deadline_ms: row.get(12)?,
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
        released_at_ms: row.get(15)?,
    })
}

fn lease_get_tx(tx: &Transaction<'_>, lease_id: &str) -> Result<Option<LeaseRow>, StoreError> {
    Ok(tx
        .query_row(
            &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE lease_id=?1"),
            params![lease_id],
            read_lease_row,
        )
        .optional()?)
}

fn map_lease_insert_conflict(err: rusqlite::Error, owner_id: &str) -> StoreError {
    if !is_constraint_violation(&err) {
        return StoreError::Sql(err);
    }
    match constraint_message(&err) {
        Some(message) if message.contains("leases.owner_id") => StoreError::OwnerLeaseExists {
            owner_id: owner_id.to_string(),
        },
        Some(message)
            if message.contains("leases.lease_id")
                || message.contains("leases.access_token")
                || message.contains("leases.cluster_name") =>
        {
            StoreError::DuplicateId
        }
        _ => StoreError::Sql(err),
    }
}

fn truncate_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.len() <= MAX_FAILURE_REASON_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_FAILURE_REASON_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

impl SqliteStore {
    /// Existence check used by id generation before an insert. A lease id is also taken
    /// when another id folds to the same cluster name.
    pub fn lease_value_exists(&self, column: LeaseColumn, value: &str) -> Result<bool, StoreError> {
        let found = match column {
            LeaseColumn::LeaseId => self
                .conn
                .query_row(
                    "SELECT 1 FROM leases WHERE lease_id=?1 OR cluster_name=?2 LIMIT 1",
                    params![value, cluster_name_for(value)],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            LeaseColumn::AccessToken => self
                .conn
                .query_row(
                    "SELECT 1 FROM leases WHERE access_token=?1 LIMIT 1",
                    params![value],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
        };
        Ok(found.is_some())
    }

    pub fn lease_insert(&mut self, request: LeaseInsertRequest) -> Result<LeaseRow, StoreError> {
        let now_ms = now_ms();
        let owner_id = request.owner_id.as_str();
        let bounds = request.params.node_bounds();

        let tx = self.conn.transaction()?;

        let outstanding = tx
            .query_row(
                "SELECT 1 FROM leases WHERE owner_id=?1 AND status<>'failed' AND released_at_ms IS NULL",
                params![owner_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if outstanding.is_some() {
            return Err(StoreError::OwnerLeaseExists {
                owner_id: owner_id.to_string(),
            });
        }

        let insert = tx.execute(
            "INSERT INTO leases(lease_id, access_token, owner_id, backing_project_id, status, zone, \
             min_nodes, max_nodes, machine_type, cluster_name, region, failure_reason, deadline_ms, \
             created_at_ms, updated_at_ms, released_at_ms) \
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10, ?11, ?11, NULL)",
            params![
                request.lease_id.as_str(),
                request.access_token.as_str(),
                owner_id,
                LeaseStatus::Pending.as_str(),
                request.params.zone(),
                bounds.min(),
                bounds.max(),
                request.params.machine_type(),
                request.lease_id.cluster_name(),
                request.deadline_ms,
                now_ms,
            ],
        );
        if let Err(err) = insert {
            return Err(map_lease_insert_conflict(err, owner_id));
        }

        let row = lease_get_tx(&tx, request.lease_id.as_str())?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn lease_get(&self, lease_id: &str) -> Result<Option<LeaseRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE lease_id=?1"),
                params![lease_id],
                read_lease_row,
            )
            .optional()?)
    }

    pub fn lease_get_by_token(&self, access_token: &str) -> Result<Option<LeaseRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE access_token=?1"),
                params![access_token],
                read_lease_row,
            )
            .optional()?)
    }

    /// The pending or ready, unreleased lease held by `owner_id`, if any.
    pub fn lease_find_outstanding(&self, owner_id: &str) -> Result<Option<LeaseRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {LEASE_COLUMNS} FROM leases \
                     WHERE owner_id=?1 AND status<>'failed' AND released_at_ms IS NULL"
                ),
                params![owner_id],
                read_lease_row,
            )
            .optional()?)
    }

    pub fn lease_set_backing_project(
        &mut self,
        lease_id: &str,
        project_id: &str,
    ) -> Result<LeaseRow, StoreError> {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return Err(StoreError::InvalidInput("backing project id must not be empty"));
        }
        if project_id.len() > MAX_PROJECT_ID_LEN {
            return Err(StoreError::InvalidInput("backing project id is too long"));
        }

        let tx = self.conn.transaction()?;
        let current = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        if current.status != LeaseStatus::Pending {
            return Err(StoreError::InvalidInput(
                "backing project can only be attached while pending",
            ));
        }
        if current.backing_project_id.is_some() {
            return Err(StoreError::InvalidInput("backing project is already attached"));
        }

        tx.execute(
            "UPDATE leases SET backing_project_id=?2, updated_at_ms=?3 \
             WHERE lease_id=?1 AND status='pending' AND backing_project_id IS NULL",
            params![lease_id, project_id, now_ms()],
        )?;
        let row = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn lease_mark_ready(&mut self, lease_id: &str, region: &str) -> Result<LeaseRow, StoreError> {
        let region = region.trim();
        if region.is_empty() {
            return Err(StoreError::InvalidInput("ready lease needs a region"));
        }
        self.lease_transition(lease_id, LeaseStatus::Ready, Some(region), None)
    }

    pub fn lease_mark_failed(&mut self, lease_id: &str, reason: &str) -> Result<LeaseRow, StoreError> {
        let reason = truncate_reason(reason);
        self.lease_transition(lease_id, LeaseStatus::Failed, None, Some(reason.as_str()))
    }

    fn lease_transition(
        &mut self,
        lease_id: &str,
        next: LeaseStatus,
        region: Option<&str>,
        reason: Option<&str>,
    ) -> Result<LeaseRow, StoreError> {
        let tx = self.conn.transaction()?;
        let current = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                lease_id: lease_id.to_string(),
                from: current.status,
                to: next,
            });
        }

        let changed = tx.execute(
            "UPDATE leases SET status=?2, region=COALESCE(?3, region), failure_reason=?4, updated_at_ms=?5 \
             WHERE lease_id=?1 AND status='pending'",
            params![lease_id, next.as_str(), region, reason, now_ms()],
        )?;
        if changed != 1 {
            return Err(StoreError::InvalidTransition {
                lease_id: lease_id.to_string(),
                from: current.status,
                to: next,
            });
        }

        let row = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(row)
    }

    /// Stamps `released_at_ms`. Returns the row and whether this call released it.
    pub fn lease_release(&mut self, lease_id: &str) -> Result<(LeaseRow, bool), StoreError> {
        let tx = self.conn.transaction()?;
        let current = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        if current.status == LeaseStatus::Pending {
            return Err(StoreError::LeasePending {
                lease_id: lease_id.to_string(),
            });
        }
        if current.is_released() {
            return Ok((current, false));
        }

        let now_ms = now_ms();
        tx.execute(
            "UPDATE leases SET released_at_ms=?2, updated_at_ms=?2 \
             WHERE lease_id=?1 AND released_at_ms IS NULL",
            params![lease_id, now_ms],
        )?;
        let row = lease_get_tx(&tx, lease_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok((row, true))
    }

    pub fn leases_list(&self, request: LeasesListRequest) -> Result<Vec<LeaseRow>, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);
        let limit = to_sqlite_i64(limit)?;
        let status = request.status.map(LeaseStatus::as_str);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases \
             WHERE (?1 IS NULL OR status=?1) AND (?2 IS NULL OR owner_id=?2) \
             ORDER BY created_at_ms DESC, lease_id ASC \
             LIMIT ?3"
        ))?;
        let mut rows = stmt.query(params![status, request.owner_id.as_deref(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_lease_row(row)?);
        }
        Ok(out)
    }

    /// Every pending lease, oldest first. Used to recover after a restart.
    pub fn leases_pending(&self) -> Result<Vec<LeaseRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM leases WHERE status='pending' \
             ORDER BY created_at_ms ASC, lease_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_lease_row(row)?);
        }
        Ok(out)
    }
}
