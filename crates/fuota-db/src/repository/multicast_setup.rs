//! # Remote Multicast Setup Repository
//!
//! Per-device multicast group membership sessions (McGroupSetup / delete).
//!
//! These rows have no prerequisite; they are the prerequisite of both the
//! fragmentation and the class-C session queues.
//!
//! ## Claim Predicate
//! ```text
//! state_provisioned = 0
//!   AND retry_count < max_retry_count
//!   AND retry_after <= now
//!   AND lease free (claimed_until IS NULL OR claimed_until <= now)
//! ```

use chrono::{Duration, Utc};
use fuota_core::validation::validate_multicast_setup;
use fuota_core::{DevEui, RemoteMulticastSetup, SessionKind};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::claim::{self, Claim, ClaimQueue, KeyPart};
use crate::error::{DbError, DbResult};

const COLUMNS: &str = "dev_eui, multicast_group_id, created_at, updated_at, mc_group_id, \
     mc_addr, mc_key_encrypted, min_mc_f_cnt, max_mc_f_cnt, state, state_provisioned, \
     retry_after, retry_count, retry_interval_secs";

const CLAIM: ClaimQueue = ClaimQueue {
    table: "remote_multicast_setup",
    entity: "RemoteMulticastSetup",
    columns: COLUMNS,
    due_column: "retry_after",
    pending: "t.state_provisioned = 0",
    retry_bounded: true,
    prerequisite: SessionKind::MulticastSetup.prerequisite(),
};

const KEY: &str = "dev_eui = ?1 AND multicast_group_id = ?2";

fn display_key(dev_eui: &DevEui, multicast_group_id: &str) -> String {
    format!("{}/{}", dev_eui, multicast_group_id)
}

/// Repository for remote multicast setup sessions.
#[derive(Debug, Clone)]
pub struct MulticastSetupRepository {
    pool: SqlitePool,
    claim_lease: Duration,
}

impl MulticastSetupRepository {
    /// Creates a new MulticastSetupRepository.
    pub fn new(pool: SqlitePool, claim_lease: Duration) -> Self {
        MulticastSetupRepository { pool, claim_lease }
    }

    /// Inserts a new, unprovisioned session with no attempts recorded.
    ///
    /// `retry_after` and `retry_interval_secs` are taken from the caller.
    ///
    /// ## Errors
    /// - `UniqueViolation` for a second row on the same (device, group) or
    ///   the same (device, mc_group_id) slot
    pub async fn create(&self, setup: &RemoteMulticastSetup) -> DbResult<RemoteMulticastSetup> {
        validate_multicast_setup(setup)?;

        let now = Utc::now();
        let mut stored = setup.clone();
        stored.created_at = now;
        stored.updated_at = now;
        stored.state_provisioned = false;
        stored.retry.retry_count = 0;

        debug!(
            dev_eui = %stored.dev_eui,
            multicast_group_id = %stored.multicast_group_id,
            mc_group_id = stored.mc_group_id,
            state = %stored.state,
            "Creating remote multicast setup"
        );

        sqlx::query(&format!(
            "INSERT INTO remote_multicast_setup ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            COLUMNS
        ))
        .bind(&stored.dev_eui)
        .bind(&stored.multicast_group_id)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(stored.mc_group_id)
        .bind(&stored.mc_addr)
        .bind(stored.mc_key_encrypted.to_vec())
        .bind(stored.min_mc_f_cnt)
        .bind(stored.max_mc_f_cnt)
        .bind(stored.state)
        .bind(stored.state_provisioned)
        .bind(stored.retry.retry_after)
        .bind(stored.retry.retry_count)
        .bind(stored.retry.retry_interval_secs)
        .execute(&self.pool)
        .await?;

        Ok(stored)
    }

    pub async fn get(
        &self,
        dev_eui: &DevEui,
        multicast_group_id: &str,
    ) -> DbResult<RemoteMulticastSetup> {
        let sql = format!("SELECT {} FROM remote_multicast_setup WHERE {}", COLUMNS, KEY);
        sqlx::query_as::<_, RemoteMulticastSetup>(&sql)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                DbError::not_found(CLAIM.entity, display_key(dev_eui, multicast_group_id))
            })
    }

    /// Claims one session regardless of its due time.
    ///
    /// ## Errors
    /// - `Claimed` if another worker holds it
    /// - `NotFound` if it does not exist
    pub async fn get_for_update(
        &self,
        dev_eui: &DevEui,
        multicast_group_id: &str,
    ) -> DbResult<Claim<RemoteMulticastSetup>> {
        claim::claim_one(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            KEY,
            &[KeyPart::Text(dev_eui.as_str()), KeyPart::Text(multicast_group_id)],
            &display_key(dev_eui, multicast_group_id),
        )
        .await
    }

    /// Claims up to `batch_size` due, unprovisioned sessions with fewer than
    /// `max_retry_count` attempts.
    pub async fn get_pending(
        &self,
        batch_size: i64,
        max_retry_count: i32,
    ) -> DbResult<Claim<RemoteMulticastSetup>> {
        let mut claim = claim::claim_pending::<RemoteMulticastSetup>(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            batch_size,
            Some(max_retry_count),
        )
        .await?;
        claim.sort_by_key(|s| (s.retry.retry_after, s.dev_eui.clone()));
        Ok(claim)
    }

    /// Persists provisioning and retry fields.
    ///
    /// `token` is the claim the caller holds, or `None` for a write made
    /// outside any claim. The claim on the row is cleared.
    ///
    /// ## Errors
    /// - `Claimed` if a different live lease holds the row
    /// - `NotFound` if the row is gone
    pub async fn update(&self, setup: &RemoteMulticastSetup, token: Option<&str>) -> DbResult<()> {
        validate_multicast_setup(setup)?;

        let sql = format!(
            r#"
            UPDATE remote_multicast_setup SET
                updated_at = ?3,
                mc_group_id = ?4,
                mc_addr = ?5,
                mc_key_encrypted = ?6,
                min_mc_f_cnt = ?7,
                max_mc_f_cnt = ?8,
                state = ?9,
                state_provisioned = ?10,
                retry_after = ?11,
                retry_count = ?12,
                retry_interval_secs = ?13,
                claim_token = NULL,
                claimed_until = NULL
            WHERE dev_eui = ?1 AND multicast_group_id = ?2 AND {}
            "#,
            claim::fence_sql(14, 15)
        );

        let now = Utc::now();
        let result = sqlx::query(&sql)
            .bind(&setup.dev_eui)
            .bind(&setup.multicast_group_id)
            .bind(now)
            .bind(setup.mc_group_id)
            .bind(&setup.mc_addr)
            .bind(setup.mc_key_encrypted.to_vec())
            .bind(setup.min_mc_f_cnt)
            .bind(setup.max_mc_f_cnt)
            .bind(setup.state)
            .bind(setup.state_provisioned)
            .bind(setup.retry.retry_after)
            .bind(setup.retry.retry_count)
            .bind(setup.retry.retry_interval_secs)
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return claim::rejected(
                &self.pool,
                &CLAIM,
                KEY,
                &[
                    KeyPart::Text(setup.dev_eui.as_str()),
                    KeyPart::Text(&setup.multicast_group_id),
                ],
                &display_key(&setup.dev_eui, &setup.multicast_group_id),
            )
            .await;
        }

        debug!(
            dev_eui = %setup.dev_eui,
            multicast_group_id = %setup.multicast_group_id,
            provisioned = setup.state_provisioned,
            retry_count = setup.retry.retry_count,
            "Updated remote multicast setup"
        );
        Ok(())
    }

    pub async fn delete(&self, dev_eui: &DevEui, multicast_group_id: &str) -> DbResult<()> {
        let sql = format!("DELETE FROM remote_multicast_setup WHERE {}", KEY);
        let result = sqlx::query(&sql)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(
                CLAIM.entity,
                display_key(dev_eui, multicast_group_id),
            ));
        }
        Ok(())
    }

    /// Every setup row of a device, ordered by slot.
    pub async fn list_for_device(&self, dev_eui: &DevEui) -> DbResult<Vec<RemoteMulticastSetup>> {
        let sql = format!(
            "SELECT {} FROM remote_multicast_setup WHERE dev_eui = ?1 ORDER BY mc_group_id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, RemoteMulticastSetup>(&sql)
            .bind(dev_eui)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Number of unprovisioned rows that hit the retry bound.
    ///
    /// These are no longer handed out by `get_pending`.
    pub async fn count_exhausted(&self, max_retry_count: i32) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM remote_multicast_setup \
             WHERE state_provisioned = 0 AND retry_count >= ?1",
        )
        .bind(max_retry_count)
        .fetch_one(&self.pool)
        .await?;

        if count > 0 {
            warn!(count, max_retry_count, "Remote multicast setups exhausted their retries");
        }
        Ok(count)
    }

    /// Abandons a claim; its rows are immediately claimable again.
    pub async fn release(&self, claim: &Claim<RemoteMulticastSetup>) -> DbResult<u64> {
        claim::release(&self.pool, CLAIM.table, claim.token()).await
    }

    /// Extends the lease of a claim that is still being worked on.
    pub async fn renew(&self, claim: &mut Claim<RemoteMulticastSetup>) -> DbResult<u64> {
        let (until, held) =
            claim::renew(&self.pool, CLAIM.table, claim.token(), self.claim_lease).await?;
        claim.extend(until);
        Ok(held)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::testing::Fixture;
    use fuota_core::{
        Aes128Key, DevAddr, ErrorKind, FixedInterval, ProvisioningSession, RetrySchedule,
        SessionState,
    };

    fn setup(dev_eui: &DevEui, group_id: &str, slot: i32) -> RemoteMulticastSetup {
        let now = Utc::now();
        RemoteMulticastSetup {
            dev_eui: dev_eui.clone(),
            multicast_group_id: group_id.to_string(),
            created_at: now,
            updated_at: now,
            mc_group_id: slot,
            mc_addr: DevAddr::from_bytes([1, 2, 3, 4]),
            mc_key_encrypted: Aes128Key::new([3; 16]),
            min_mc_f_cnt: 0,
            max_mc_f_cnt: 4_294_967_295,
            state: SessionState::Setup,
            state_provisioned: false,
            retry: RetrySchedule::new(now - Duration::seconds(1), Duration::zero()),
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.multicast_setups();

        let mut input = setup(&fixture.devices[0], &group.id, 2);
        input.state_provisioned = true;
        input.retry.retry_count = 9;

        let created = repo.create(&input).await.unwrap();
        assert!(!created.state_provisioned);
        assert_eq!(created.retry.retry_count, 0);

        let loaded = repo.get(&fixture.devices[0], &group.id).await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_slot_and_group_are_unique_per_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let g1 = fixture.group(&db, "g1").await;
        let g2 = fixture.group(&db, "g2").await;
        let repo = db.multicast_setups();
        let dev = &fixture.devices[0];

        repo.create(&setup(dev, &g1.id, 0)).await.unwrap();

        let same_group = repo.create(&setup(dev, &g1.id, 1)).await.unwrap_err();
        assert_eq!(same_group.kind(), ErrorKind::AlreadyExists);

        let same_slot = repo.create(&setup(dev, &g2.id, 0)).await.unwrap_err();
        assert_eq!(same_slot.kind(), ErrorKind::AlreadyExists);

        let bad_slot = repo.create(&setup(dev, &g2.id, 4)).await.unwrap_err();
        assert_eq!(bad_slot.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_pending_retry_cycle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.multicast_setups();

        repo.create(&setup(&fixture.devices[0], &group.id, 0))
            .await
            .unwrap();

        let claim = repo.get_pending(10, 3).await.unwrap();
        assert_eq!(claim.len(), 1);

        // No answer yet: reschedule one minute out.
        let token = claim.token().to_string();
        let mut row = claim.into_items().remove(0);
        row.schedule_retry(&FixedInterval(Duration::minutes(1)), Utc::now());
        repo.update(&row, Some(&token)).await.unwrap();

        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());
        let loaded = repo.get(&row.dev_eui, &row.multicast_group_id).await.unwrap();
        assert_eq!(loaded.retry.retry_count, 1);
        assert_eq!(loaded.retry.retry_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_exhausted_rows_are_skipped() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.multicast_setups();

        let mut row = repo
            .create(&setup(&fixture.devices[0], &group.id, 0))
            .await
            .unwrap();
        row.retry.retry_count = 3;
        repo.update(&row, None).await.unwrap();

        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());
        assert_eq!(repo.get_pending(10, 4).await.unwrap().len(), 1);
        assert_eq!(repo.count_exhausted(3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_update_missing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.multicast_setups();
        let dev = &fixture.devices[0];

        let row = repo.create(&setup(dev, &group.id, 1)).await.unwrap();
        repo.delete(dev, &group.id).await.unwrap();

        assert_eq!(repo.delete(dev, &group.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(repo.update(&row, None).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(repo.list_for_device(dev).await.unwrap().is_empty());
    }
}
