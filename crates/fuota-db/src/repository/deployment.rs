//! # Deployment Repository
//!
//! Deployments, their per-device outcomes, and the deployment claim queue.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  create(deployment, devices)                                           │
//! │  ┌─────────────────────────── SINGLE TRANSACTION ───────────────────┐  │
//! │  │ INSERT fuota_deployment (state = MC_CREATE)                      │  │
//! │  │ INSERT fuota_deployment_device × N (state = PENDING)             │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  get_pending(n) ──► step executor acts ──► update(d, token)            │
//! │       ▲                                        │                        │
//! │       └──────── next_step_after reached ◄──────┘                        │
//! │                                                                         │
//! │  set_device_state(id, dev, SUCCESS | ERROR, msg)   PENDING → terminal  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transition order is the step executor's responsibility; `update` stores
//! whatever state it is given.

use chrono::{Duration, Utc};
use fuota_core::validation::{validate_deployment, validate_device_list};
use fuota_core::{
    DevEui, DeploymentFilters, DeploymentState, DeviceState, FuotaDeployment,
    FuotaDeploymentDevice, FuotaDeploymentDeviceListItem, FuotaDeploymentListItem, Prerequisite,
};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::claim::{self, Claim, ClaimQueue, KeyPart};
use crate::error::{DbError, DbResult};

const COLUMNS: &str = "id, created_at, updated_at, name, multicast_group_id, group_type, dr, \
     frequency, ping_slot_period, fragmentation_matrix, descriptor, payload, frag_size, \
     redundancy, block_ack_delay, multicast_timeout, unicast_timeout_secs, state, next_step_after";

const DEVICE_COLUMNS: &str =
    "fuota_deployment_id, dev_eui, created_at, updated_at, state, error_message";

const CLAIM: ClaimQueue = ClaimQueue {
    table: "fuota_deployment",
    entity: "FuotaDeployment",
    columns: COLUMNS,
    due_column: "next_step_after",
    pending: "t.state <> 'DONE'",
    retry_bounded: false,
    prerequisite: Prerequisite::None,
};

// Shared by list and count; binds ?1 dev_eui, ?2 application_id.
const FILTERS: &str = r#"
    (?1 IS NULL OR EXISTS (
        SELECT 1 FROM fuota_deployment_device fd
        WHERE fd.fuota_deployment_id = d.id AND fd.dev_eui = ?1
    ))
    AND (?2 IS NULL OR EXISTS (
        SELECT 1 FROM fuota_deployment_device fd
        JOIN device dv ON dv.dev_eui = fd.dev_eui
        WHERE fd.fuota_deployment_id = d.id AND dv.application_id = ?2
    ))
"#;

/// Repository for deployment operations.
#[derive(Debug, Clone)]
pub struct DeploymentRepository {
    pool: SqlitePool,
    claim_lease: Duration,
}

impl DeploymentRepository {
    /// Creates a new DeploymentRepository.
    pub fn new(pool: SqlitePool, claim_lease: Duration) -> Self {
        DeploymentRepository { pool, claim_lease }
    }

    // =========================================================================
    // Deployments
    // =========================================================================

    /// Inserts a deployment and binds its devices atomically.
    ///
    /// The stored deployment starts in MC_CREATE with the caller's
    /// `next_step_after`; every device starts PENDING.
    ///
    /// ## Errors
    /// - `Validation` for invalid parameters, an empty or duplicated device list
    /// - `UniqueViolation` if the id is taken (nothing is written)
    /// - `ForeignKeyViolation` for an unknown device or multicast group
    pub async fn create(
        &self,
        deployment: &FuotaDeployment,
        devices: &[DevEui],
    ) -> DbResult<FuotaDeployment> {
        validate_deployment(deployment)?;
        validate_device_list(devices)?;

        let now = Utc::now();
        let stored = FuotaDeployment {
            created_at: now,
            updated_at: now,
            state: DeploymentState::McCreate,
            ..deployment.clone()
        };

        debug!(id = %stored.id, devices = devices.len(), "Creating deployment");

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO fuota_deployment ({}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )
            "#,
            COLUMNS
        ))
        .bind(&stored.id)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(&stored.name)
        .bind(&stored.multicast_group_id)
        .bind(stored.group_type)
        .bind(stored.dr)
        .bind(stored.frequency)
        .bind(stored.ping_slot_period)
        .bind(stored.fragmentation_matrix)
        .bind(&stored.descriptor)
        .bind(&stored.payload)
        .bind(stored.frag_size)
        .bind(stored.redundancy)
        .bind(stored.block_ack_delay)
        .bind(stored.multicast_timeout)
        .bind(stored.unicast_timeout_secs)
        .bind(stored.state)
        .bind(stored.next_step_after)
        .execute(&mut *tx)
        .await?;

        for dev_eui in devices {
            sqlx::query(
                r#"
                INSERT INTO fuota_deployment_device (
                    fuota_deployment_id, dev_eui, created_at, updated_at, state, error_message
                ) VALUES (?1, ?2, ?3, ?3, ?4, NULL)
                "#,
            )
            .bind(&stored.id)
            .bind(dev_eui)
            .bind(now)
            .bind(DeviceState::Pending)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        info!(id = %stored.id, name = %stored.name, devices = devices.len(), "Deployment created");
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> DbResult<FuotaDeployment> {
        let sql = format!("SELECT {} FROM fuota_deployment WHERE id = ?1", COLUMNS);
        sqlx::query_as::<_, FuotaDeployment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("FuotaDeployment", id))
    }

    /// Claims one deployment regardless of its due time.
    ///
    /// ## Errors
    /// - `Claimed` if another worker holds it
    /// - `NotFound` if it does not exist
    pub async fn get_for_update(&self, id: &str) -> DbResult<Claim<FuotaDeployment>> {
        claim::claim_one(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            "id = ?1",
            &[KeyPart::Text(id)],
            id,
        )
        .await
    }

    /// Claims up to `batch_size` deployments with `state ≠ DONE` and
    /// `next_step_after ≤ now`, oldest due first.
    ///
    /// Returns an empty claim when nothing is due.
    pub async fn get_pending(&self, batch_size: i64) -> DbResult<Claim<FuotaDeployment>> {
        let mut claim = claim::claim_pending::<FuotaDeployment>(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            batch_size,
            None,
        )
        .await?;
        claim.sort_by_key(|d| (d.next_step_after, d.id.clone()));
        Ok(claim)
    }

    /// Full-row replace; clears the claim on the row.
    ///
    /// `token` is the claim the caller holds, or `None` for a write made
    /// outside any claim.
    ///
    /// ## Errors
    /// - `Claimed` if a different live lease holds the row
    /// - `NotFound` if the deployment is gone
    pub async fn update(&self, deployment: &FuotaDeployment, token: Option<&str>) -> DbResult<()> {
        validate_deployment(deployment)?;

        debug!(
            id = %deployment.id,
            state = %deployment.state,
            next_step_after = %deployment.next_step_after,
            "Updating deployment"
        );

        let sql = format!(
            r#"
            UPDATE fuota_deployment SET
                updated_at = ?2,
                name = ?3,
                multicast_group_id = ?4,
                group_type = ?5,
                dr = ?6,
                frequency = ?7,
                ping_slot_period = ?8,
                fragmentation_matrix = ?9,
                descriptor = ?10,
                payload = ?11,
                frag_size = ?12,
                redundancy = ?13,
                block_ack_delay = ?14,
                multicast_timeout = ?15,
                unicast_timeout_secs = ?16,
                state = ?17,
                next_step_after = ?18,
                claim_token = NULL,
                claimed_until = NULL
            WHERE id = ?1 AND {}
            "#,
            claim::fence_sql(19, 20)
        );

        let now = Utc::now();
        let result = sqlx::query(&sql)
            .bind(&deployment.id)
            .bind(now)
            .bind(&deployment.name)
            .bind(&deployment.multicast_group_id)
            .bind(deployment.group_type)
            .bind(deployment.dr)
            .bind(deployment.frequency)
            .bind(deployment.ping_slot_period)
            .bind(deployment.fragmentation_matrix)
            .bind(&deployment.descriptor)
            .bind(&deployment.payload)
            .bind(deployment.frag_size)
            .bind(deployment.redundancy)
            .bind(deployment.block_ack_delay)
            .bind(deployment.multicast_timeout)
            .bind(deployment.unicast_timeout_secs)
            .bind(deployment.state)
            .bind(deployment.next_step_after)
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return claim::rejected(
                &self.pool,
                &CLAIM,
                "id = ?1",
                &[KeyPart::Text(&deployment.id)],
                &deployment.id,
            )
            .await;
        }

        if deployment.state.is_terminal() {
            info!(id = %deployment.id, "Deployment done");
        }

        Ok(())
    }

    /// Abandons a claim; its rows are immediately claimable again.
    pub async fn release(&self, claim: &Claim<FuotaDeployment>) -> DbResult<u64> {
        claim::release(&self.pool, CLAIM.table, claim.token()).await
    }

    /// Extends the lease of a claim that is still being worked on.
    pub async fn renew(&self, claim: &mut Claim<FuotaDeployment>) -> DbResult<u64> {
        let (until, held) =
            claim::renew(&self.pool, CLAIM.table, claim.token(), self.claim_lease).await?;
        claim.extend(until);
        Ok(held)
    }

    /// Deployments matching `filters`, newest first.
    pub async fn list(
        &self,
        filters: &DeploymentFilters,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<FuotaDeploymentListItem>> {
        let sql = format!(
            r#"
            SELECT d.id, d.created_at, d.updated_at, d.name, d.state, d.next_step_after
            FROM fuota_deployment d
            WHERE {}
            ORDER BY d.created_at DESC, d.id
            LIMIT ?3 OFFSET ?4
            "#,
            FILTERS
        );

        let items = sqlx::query_as::<_, FuotaDeploymentListItem>(&sql)
            .bind(&filters.dev_eui)
            .bind(filters.application_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    pub async fn count(&self, filters: &DeploymentFilters) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM fuota_deployment d WHERE {}", FILTERS);
        let count = sqlx::query_scalar(&sql)
            .bind(&filters.dev_eui)
            .bind(filters.application_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Per-device outcomes
    // =========================================================================

    pub async fn get_device(
        &self,
        fuota_deployment_id: &str,
        dev_eui: &DevEui,
    ) -> DbResult<FuotaDeploymentDevice> {
        let sql = format!(
            "SELECT {} FROM fuota_deployment_device WHERE fuota_deployment_id = ?1 AND dev_eui = ?2",
            DEVICE_COLUMNS
        );
        sqlx::query_as::<_, FuotaDeploymentDevice>(&sql)
            .bind(fuota_deployment_id)
            .bind(dev_eui)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                DbError::not_found(
                    "FuotaDeploymentDevice",
                    format!("{}/{}", fuota_deployment_id, dev_eui),
                )
            })
    }

    /// The PENDING outcome row of a device, across all deployments.
    ///
    /// If the device is pending in more than one deployment, the most
    /// recently created row wins.
    ///
    /// ## Errors
    /// `NotFound` when the device has no PENDING row.
    pub async fn get_pending_device(&self, dev_eui: &DevEui) -> DbResult<FuotaDeploymentDevice> {
        let sql = format!(
            r#"
            SELECT {} FROM fuota_deployment_device
            WHERE dev_eui = ?1 AND state = 'PENDING'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            DEVICE_COLUMNS
        );
        sqlx::query_as::<_, FuotaDeploymentDevice>(&sql)
            .bind(dev_eui)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("PendingFuotaDeploymentDevice", dev_eui.as_str()))
    }

    /// Moves a device outcome from PENDING to SUCCESS or ERROR.
    ///
    /// ## Rules
    /// - only PENDING rows change; terminal rows fail with `InvalidState`
    /// - ERROR requires a message, SUCCESS forbids one (`Validation`)
    pub async fn set_device_state(
        &self,
        fuota_deployment_id: &str,
        dev_eui: &DevEui,
        state: DeviceState,
        error_message: Option<String>,
    ) -> DbResult<FuotaDeploymentDevice> {
        let mut device = self.get_device(fuota_deployment_id, dev_eui).await?;
        device.set_outcome(state, error_message)?;
        device.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE fuota_deployment_device SET
                updated_at = ?3,
                state = ?4,
                error_message = ?5
            WHERE fuota_deployment_id = ?1 AND dev_eui = ?2 AND state = 'PENDING'
            "#,
        )
        .bind(fuota_deployment_id)
        .bind(dev_eui)
        .bind(device.updated_at)
        .bind(device.state)
        .bind(&device.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::InvalidState(format!(
                "device {} of deployment {} left PENDING concurrently",
                dev_eui, fuota_deployment_id
            )));
        }

        debug!(
            fuota_deployment_id = %fuota_deployment_id,
            dev_eui = %dev_eui,
            state = %device.state,
            "Device outcome recorded"
        );
        Ok(device)
    }

    /// Device outcomes of a deployment joined with device names.
    pub async fn list_devices(
        &self,
        fuota_deployment_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<FuotaDeploymentDeviceListItem>> {
        let items = sqlx::query_as::<_, FuotaDeploymentDeviceListItem>(
            r#"
            SELECT fd.created_at, fd.updated_at, fd.fuota_deployment_id, fd.dev_eui,
                   dv.name AS device_name, fd.state, fd.error_message
            FROM fuota_deployment_device fd
            JOIN device dv ON dv.dev_eui = fd.dev_eui
            WHERE fd.fuota_deployment_id = ?1
            ORDER BY dv.name, fd.dev_eui
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(fuota_deployment_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn count_devices(&self, fuota_deployment_id: &str) -> DbResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fuota_deployment_device WHERE fuota_deployment_id = ?1",
        )
        .bind(fuota_deployment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
