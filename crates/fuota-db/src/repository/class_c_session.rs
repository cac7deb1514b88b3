//! # Remote Multicast Class-C Session Repository
//!
//! Per-device class-C receive windows (McClassCSessionReq).
//!
//! A row is claimable only while the device's multicast setup for the same
//! group is provisioned with intent SETUP.

use chrono::{Duration, Utc};
use fuota_core::validation::validate_class_c_session;
use fuota_core::{DevEui, RemoteMulticastClassCSession, SessionKind};
use sqlx::SqlitePool;
use tracing::debug;

use crate::claim::{self, Claim, ClaimQueue, KeyPart};
use crate::error::{DbError, DbResult};

const COLUMNS: &str = "dev_eui, multicast_group_id, created_at, updated_at, mc_group_id, \
     session_time, session_time_out, dl_frequency, dr, state_provisioned, \
     retry_after, retry_count, retry_interval_secs";

const CLAIM: ClaimQueue = ClaimQueue {
    table: "remote_multicast_class_c_session",
    entity: "RemoteMulticastClassCSession",
    columns: COLUMNS,
    due_column: "retry_after",
    pending: "t.state_provisioned = 0",
    retry_bounded: true,
    prerequisite: SessionKind::MulticastClassCSession.prerequisite(),
};

const KEY: &str = "dev_eui = ?1 AND multicast_group_id = ?2";

fn display_key(dev_eui: &DevEui, multicast_group_id: &str) -> String {
    format!("{}/{}", dev_eui, multicast_group_id)
}

/// Repository for remote multicast class-C sessions.
#[derive(Debug, Clone)]
pub struct ClassCSessionRepository {
    pool: SqlitePool,
    claim_lease: Duration,
}

impl ClassCSessionRepository {
    /// Creates a new ClassCSessionRepository.
    pub fn new(pool: SqlitePool, claim_lease: Duration) -> Self {
        ClassCSessionRepository { pool, claim_lease }
    }

    pub async fn create(
        &self,
        session: &RemoteMulticastClassCSession,
    ) -> DbResult<RemoteMulticastClassCSession> {
        validate_class_c_session(session)?;

        let now = Utc::now();
        let mut stored = session.clone();
        stored.created_at = now;
        stored.updated_at = now;
        stored.state_provisioned = false;
        stored.retry.retry_count = 0;

        debug!(
            dev_eui = %stored.dev_eui,
            multicast_group_id = %stored.multicast_group_id,
            session_time = %stored.session_time,
            "Creating remote multicast class-C session"
        );

        sqlx::query(&format!(
            "INSERT INTO remote_multicast_class_c_session ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            COLUMNS
        ))
        .bind(&stored.dev_eui)
        .bind(&stored.multicast_group_id)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(stored.mc_group_id)
        .bind(stored.session_time)
        .bind(stored.session_time_out)
        .bind(stored.dl_frequency)
        .bind(stored.dr)
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
    ) -> DbResult<RemoteMulticastClassCSession> {
        let sql = format!(
            "SELECT {} FROM remote_multicast_class_c_session WHERE {}",
            COLUMNS, KEY
        );
        sqlx::query_as::<_, RemoteMulticastClassCSession>(&sql)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                DbError::not_found(CLAIM.entity, display_key(dev_eui, multicast_group_id))
            })
    }

    pub async fn get_for_update(
        &self,
        dev_eui: &DevEui,
        multicast_group_id: &str,
    ) -> DbResult<Claim<RemoteMulticastClassCSession>> {
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

    /// Claims up to `batch_size` due sessions whose group setup is
    /// provisioned.
    pub async fn get_pending(
        &self,
        batch_size: i64,
        max_retry_count: i32,
    ) -> DbResult<Claim<RemoteMulticastClassCSession>> {
        let mut claim = claim::claim_pending::<RemoteMulticastClassCSession>(
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
    pub async fn update(
        &self,
        session: &RemoteMulticastClassCSession,
        token: Option<&str>,
    ) -> DbResult<()> {
        validate_class_c_session(session)?;

        let sql = format!(
            r#"
            UPDATE remote_multicast_class_c_session SET
                updated_at = ?3,
                mc_group_id = ?4,
                session_time = ?5,
                session_time_out = ?6,
                dl_frequency = ?7,
                dr = ?8,
                state_provisioned = ?9,
                retry_after = ?10,
                retry_count = ?11,
                retry_interval_secs = ?12,
                claim_token = NULL,
                claimed_until = NULL
            WHERE dev_eui = ?1 AND multicast_group_id = ?2 AND {}
            "#,
            claim::fence_sql(13, 14)
        );

        let now = Utc::now();
        let result = sqlx::query(&sql)
            .bind(&session.dev_eui)
            .bind(&session.multicast_group_id)
            .bind(now)
            .bind(session.mc_group_id)
            .bind(session.session_time)
            .bind(session.session_time_out)
            .bind(session.dl_frequency)
            .bind(session.dr)
            .bind(session.state_provisioned)
            .bind(session.retry.retry_after)
            .bind(session.retry.retry_count)
            .bind(session.retry.retry_interval_secs)
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
                    KeyPart::Text(session.dev_eui.as_str()),
                    KeyPart::Text(&session.multicast_group_id),
                ],
                &display_key(&session.dev_eui, &session.multicast_group_id),
            )
            .await;
        }

        debug!(
            dev_eui = %session.dev_eui,
            multicast_group_id = %session.multicast_group_id,
            provisioned = session.state_provisioned,
            "Updated remote multicast class-C session"
        );
        Ok(())
    }

    pub async fn delete(&self, dev_eui: &DevEui, multicast_group_id: &str) -> DbResult<()> {
        let sql = format!("DELETE FROM remote_multicast_class_c_session WHERE {}", KEY);
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

    pub async fn list_for_device(
        &self,
        dev_eui: &DevEui,
    ) -> DbResult<Vec<RemoteMulticastClassCSession>> {
        let sql = format!(
            "SELECT {} FROM remote_multicast_class_c_session WHERE dev_eui = ?1 \
             ORDER BY session_time",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, RemoteMulticastClassCSession>(&sql)
            .bind(dev_eui)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn release(&self, claim: &Claim<RemoteMulticastClassCSession>) -> DbResult<u64> {
        claim::release(&self.pool, CLAIM.table, claim.token()).await
    }

    pub async fn renew(&self, claim: &mut Claim<RemoteMulticastClassCSession>) -> DbResult<u64> {
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
        Aes128Key, DevAddr, ErrorKind, FixedInterval, ProvisioningSession, RemoteMulticastSetup,
        RetrySchedule, SessionState,
    };

    fn class_c(dev_eui: &DevEui, group_id: &str) -> RemoteMulticastClassCSession {
        let now = Utc::now();
        RemoteMulticastClassCSession {
            dev_eui: dev_eui.clone(),
            multicast_group_id: group_id.to_string(),
            created_at: now,
            updated_at: now,
            mc_group_id: 0,
            session_time: now + Duration::minutes(10),
            session_time_out: 8,
            dl_frequency: 869_525_000,
            dr: 3,
            state_provisioned: false,
            retry: RetrySchedule::new(now - Duration::seconds(1), Duration::zero()),
        }
    }

    fn setup(dev_eui: &DevEui, group_id: &str, state: SessionState) -> RemoteMulticastSetup {
        let now = Utc::now();
        RemoteMulticastSetup {
            dev_eui: dev_eui.clone(),
            multicast_group_id: group_id.to_string(),
            created_at: now,
            updated_at: now,
            mc_group_id: 0,
            mc_addr: DevAddr::from_bytes([1, 2, 3, 4]),
            mc_key_encrypted: Aes128Key::new([3; 16]),
            min_mc_f_cnt: 0,
            max_mc_f_cnt: 1000,
            state,
            state_provisioned: false,
            retry: RetrySchedule::new(now - Duration::seconds(1), Duration::zero()),
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.class_c_sessions();

        let created = repo.create(&class_c(&fixture.devices[0], &group.id)).await.unwrap();
        let loaded = repo.get(&fixture.devices[0], &group.id).await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_waits_for_provisioned_setup() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let dev = &fixture.devices[0];
        let group = fixture.group(&db, "g").await;
        let setups = db.multicast_setups();
        let repo = db.class_c_sessions();

        repo.create(&class_c(dev, &group.id)).await.unwrap();
        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());

        let mut s = setups
            .create(&setup(dev, &group.id, SessionState::Setup))
            .await
            .unwrap();
        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());

        s.mark_provisioned(Utc::now());
        setups.update(&s, None).await.unwrap();
        assert_eq!(repo.get_pending(10, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_intent_does_not_satisfy_dependency() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let dev = &fixture.devices[0];
        let group = fixture.group(&db, "g").await;
        let setups = db.multicast_setups();
        let repo = db.class_c_sessions();

        let mut s = setups
            .create(&setup(dev, &group.id, SessionState::Delete))
            .await
            .unwrap();
        s.mark_provisioned(Utc::now());
        setups.update(&s, None).await.unwrap();

        repo.create(&class_c(dev, &group.id)).await.unwrap();
        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_and_renew() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let dev = &fixture.devices[0];
        let group = fixture.group(&db, "g").await;
        let setups = db.multicast_setups();
        let repo = db.class_c_sessions();

        let mut s = setups
            .create(&setup(dev, &group.id, SessionState::Setup))
            .await
            .unwrap();
        s.mark_provisioned(Utc::now());
        setups.update(&s, None).await.unwrap();
        repo.create(&class_c(dev, &group.id)).await.unwrap();

        let mut claim = repo.get_pending(10, 3).await.unwrap();
        let before = claim.claimed_until();
        assert_eq!(repo.renew(&mut claim).await.unwrap(), 1);
        assert!(claim.claimed_until() >= before);

        let token = claim.token().to_string();
        let mut row = claim.into_items().remove(0);
        row.schedule_retry(&FixedInterval(Duration::hours(1)), Utc::now());
        repo.update(&row, Some(&token)).await.unwrap();

        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());
        assert_eq!(repo.get(dev, &group.id).await.unwrap().retry.retry_count, 1);
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let group = fixture.group(&db, "g").await;
        let repo = db.class_c_sessions();

        let err = repo.delete(&fixture.devices[0], &group.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
