//! # Remote Fragmentation Session Repository
//!
//! Per-device fragmentation transport sessions (FragSessionSetup / delete).
//!
//! A session listens on zero or more multicast slots. It becomes claimable
//! only once every slot in `mc_group_ids` has a provisioned multicast setup
//! on the same device; an empty list means unicast delivery and has no
//! dependency.

use chrono::{Duration, Utc};
use fuota_core::validation::validate_fragmentation_session;
use fuota_core::{DevEui, RemoteFragmentationSession, SessionKind};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::debug;

use crate::claim::{self, Claim, ClaimQueue, KeyPart};
use crate::error::{DbError, DbResult};

const COLUMNS: &str = "dev_eui, frag_index, created_at, updated_at, mc_group_ids, nb_frag, \
     frag_size, fragmentation_matrix, block_ack_delay, padding, descriptor, state, \
     state_provisioned, retry_after, retry_count, retry_interval_secs";

const CLAIM: ClaimQueue = ClaimQueue {
    table: "remote_fragmentation_session",
    entity: "RemoteFragmentationSession",
    columns: COLUMNS,
    due_column: "retry_after",
    pending: "t.state_provisioned = 0",
    retry_bounded: true,
    prerequisite: SessionKind::FragmentationSession.prerequisite(),
};

const KEY: &str = "dev_eui = ?1 AND frag_index = ?2";

fn display_key(dev_eui: &DevEui, frag_index: i32) -> String {
    format!("{}/{}", dev_eui, frag_index)
}

/// Repository for remote fragmentation sessions.
#[derive(Debug, Clone)]
pub struct FragmentationSessionRepository {
    pool: SqlitePool,
    claim_lease: Duration,
}

impl FragmentationSessionRepository {
    /// Creates a new FragmentationSessionRepository.
    pub fn new(pool: SqlitePool, claim_lease: Duration) -> Self {
        FragmentationSessionRepository { pool, claim_lease }
    }

    /// Inserts a new, unprovisioned session.
    ///
    /// ## Errors
    /// - `Validation` for an out-of-range slot, a duplicate `mc_group_ids`
    ///   entry or a malformed descriptor
    /// - `UniqueViolation` if the device already uses `frag_index`
    pub async fn create(
        &self,
        session: &RemoteFragmentationSession,
    ) -> DbResult<RemoteFragmentationSession> {
        validate_fragmentation_session(session)?;

        let now = Utc::now();
        let mut stored = session.clone();
        stored.created_at = now;
        stored.updated_at = now;
        stored.state_provisioned = false;
        stored.retry.retry_count = 0;

        debug!(
            dev_eui = %stored.dev_eui,
            frag_index = stored.frag_index,
            mc_group_ids = ?stored.mc_group_ids,
            nb_frag = stored.nb_frag,
            "Creating remote fragmentation session"
        );

        sqlx::query(&format!(
            "INSERT INTO remote_fragmentation_session ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            COLUMNS
        ))
        .bind(&stored.dev_eui)
        .bind(stored.frag_index)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(Json(&stored.mc_group_ids))
        .bind(stored.nb_frag)
        .bind(stored.frag_size)
        .bind(stored.fragmentation_matrix)
        .bind(stored.block_ack_delay)
        .bind(stored.padding)
        .bind(&stored.descriptor)
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
        frag_index: i32,
    ) -> DbResult<RemoteFragmentationSession> {
        let sql = format!(
            "SELECT {} FROM remote_fragmentation_session WHERE {}",
            COLUMNS, KEY
        );
        sqlx::query_as::<_, RemoteFragmentationSession>(&sql)
            .bind(dev_eui)
            .bind(frag_index)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(CLAIM.entity, display_key(dev_eui, frag_index)))
    }

    /// Claims one session regardless of due time or prerequisite.
    pub async fn get_for_update(
        &self,
        dev_eui: &DevEui,
        frag_index: i32,
    ) -> DbResult<Claim<RemoteFragmentationSession>> {
        claim::claim_one(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            KEY,
            &[KeyPart::Text(dev_eui.as_str()), KeyPart::Int(frag_index as i64)],
            &display_key(dev_eui, frag_index),
        )
        .await
    }

    /// Claims up to `batch_size` due sessions whose multicast slots are all
    /// provisioned.
    pub async fn get_pending(
        &self,
        batch_size: i64,
        max_retry_count: i32,
    ) -> DbResult<Claim<RemoteFragmentationSession>> {
        let mut claim = claim::claim_pending::<RemoteFragmentationSession>(
            &self.pool,
            &CLAIM,
            self.claim_lease,
            batch_size,
            Some(max_retry_count),
        )
        .await?;
        claim.sort_by_key(|s| (s.retry.retry_after, s.dev_eui.clone(), s.frag_index));
        Ok(claim)
    }

    /// Persists the session.
    ///
    /// `token` is the claim the caller holds, or `None` for a write made
    /// outside any claim. The claim on the row is cleared.
    ///
    /// ## Errors
    /// - `Claimed` if a different live lease holds the row
    /// - `NotFound` if the row is gone
    pub async fn update(
        &self,
        session: &RemoteFragmentationSession,
        token: Option<&str>,
    ) -> DbResult<()> {
        validate_fragmentation_session(session)?;

        let sql = format!(
            r#"
            UPDATE remote_fragmentation_session SET
                updated_at = ?3,
                mc_group_ids = ?4,
                nb_frag = ?5,
                frag_size = ?6,
                fragmentation_matrix = ?7,
                block_ack_delay = ?8,
                padding = ?9,
                descriptor = ?10,
                state = ?11,
                state_provisioned = ?12,
                retry_after = ?13,
                retry_count = ?14,
                retry_interval_secs = ?15,
                claim_token = NULL,
                claimed_until = NULL
            WHERE dev_eui = ?1 AND frag_index = ?2 AND {}
            "#,
            claim::fence_sql(16, 17)
        );

        let now = Utc::now();
        let result = sqlx::query(&sql)
            .bind(&session.dev_eui)
            .bind(session.frag_index)
            .bind(now)
            .bind(Json(&session.mc_group_ids))
            .bind(session.nb_frag)
            .bind(session.frag_size)
            .bind(session.fragmentation_matrix)
            .bind(session.block_ack_delay)
            .bind(session.padding)
            .bind(&session.descriptor)
            .bind(session.state)
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
                    KeyPart::Int(session.frag_index as i64),
                ],
                &display_key(&session.dev_eui, session.frag_index),
            )
            .await;
        }

        debug!(
            dev_eui = %session.dev_eui,
            frag_index = session.frag_index,
            provisioned = session.state_provisioned,
            retry_count = session.retry.retry_count,
            "Updated remote fragmentation session"
        );
        Ok(())
    }

    pub async fn delete(&self, dev_eui: &DevEui, frag_index: i32) -> DbResult<()> {
        let sql = format!("DELETE FROM remote_fragmentation_session WHERE {}", KEY);
        let result = sqlx::query(&sql)
            .bind(dev_eui)
            .bind(frag_index)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(CLAIM.entity, display_key(dev_eui, frag_index)));
        }
        Ok(())
    }

    pub async fn list_for_device(
        &self,
        dev_eui: &DevEui,
    ) -> DbResult<Vec<RemoteFragmentationSession>> {
        let sql = format!(
            "SELECT {} FROM remote_fragmentation_session WHERE dev_eui = ?1 ORDER BY frag_index",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, RemoteFragmentationSession>(&sql)
            .bind(dev_eui)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn release(&self, claim: &Claim<RemoteFragmentationSession>) -> DbResult<u64> {
        claim::release(&self.pool, CLAIM.table, claim.token()).await
    }

    pub async fn renew(&self, claim: &mut Claim<RemoteFragmentationSession>) -> DbResult<u64> {
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
        Aes128Key, DevAddr, ErrorKind, ProvisioningSession, RemoteMulticastSetup,
        RetrySchedule, SessionState,
    };

    fn session(dev_eui: &DevEui, frag_index: i32, slots: Vec<i32>) -> RemoteFragmentationSession {
        let now = Utc::now();
        RemoteFragmentationSession {
            dev_eui: dev_eui.clone(),
            frag_index,
            created_at: now,
            updated_at: now,
            mc_group_ids: slots,
            nb_frag: 20,
            frag_size: 50,
            fragmentation_matrix: 0,
            block_ack_delay: 1,
            padding: 3,
            descriptor: vec![0, 0, 0, 0],
            state: SessionState::Setup,
            state_provisioned: false,
            retry: RetrySchedule::new(now - Duration::seconds(1), Duration::zero()),
        }
    }

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
            max_mc_f_cnt: 1000,
            state: SessionState::Setup,
            state_provisioned: false,
            retry: RetrySchedule::new(now - Duration::seconds(1), Duration::zero()),
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();

        let created = repo
            .create(&session(&fixture.devices[0], 1, vec![0, 2]))
            .await
            .unwrap();
        let loaded = repo.get(&fixture.devices[0], 1).await.unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.mc_group_ids, vec![0, 2]);

        let dup = repo
            .create(&session(&fixture.devices[0], 1, vec![]))
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_unicast_session_has_no_dependency() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();

        repo.create(&session(&fixture.devices[0], 0, vec![]))
            .await
            .unwrap();

        assert_eq!(repo.get_pending(10, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_every_multicast_slot() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let dev = &fixture.devices[0];
        let g0 = fixture.group(&db, "g0").await;
        let g2 = fixture.group(&db, "g2").await;
        let setups = db.multicast_setups();
        let repo = db.fragmentation_sessions();

        let mut s0 = setups.create(&setup(dev, &g0.id, 0)).await.unwrap();
        let mut s2 = setups.create(&setup(dev, &g2.id, 2)).await.unwrap();
        repo.create(&session(dev, 0, vec![0, 2])).await.unwrap();

        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());

        s0.mark_provisioned(Utc::now());
        setups.update(&s0, None).await.unwrap();
        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());

        s2.mark_provisioned(Utc::now());
        setups.update(&s2, None).await.unwrap();
        let claim = repo.get_pending(10, 3).await.unwrap();
        assert_eq!(claim.len(), 1);
        assert_eq!(claim.items()[0].frag_index, 0);
    }

    #[tokio::test]
    async fn test_provisioned_session_leaves_queue() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();

        repo.create(&session(&fixture.devices[0], 3, vec![]))
            .await
            .unwrap();

        let claim = repo.get_pending(10, 3).await.unwrap();
        let token = claim.token().to_string();
        let mut row = claim.into_items().remove(0);
        row.mark_provisioned(Utc::now());
        repo.update(&row, Some(&token)).await.unwrap();

        assert!(repo.get_pending(10, 3).await.unwrap().is_empty());
        assert!(repo.get(&row.dev_eui, 3).await.unwrap().state_provisioned);
    }

    #[tokio::test]
    async fn test_get_for_update_conflict_and_release() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();
        let dev = &fixture.devices[0];

        repo.create(&session(dev, 0, vec![1])).await.unwrap();

        let claim = repo.get_for_update(dev, 0).await.unwrap();
        let err = repo.get_for_update(dev, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert_eq!(repo.release(&claim).await.unwrap(), 1);
        assert!(repo.get_for_update(dev, 0).await.is_ok());

        let missing = repo.get_for_update(dev, 2).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_fenced_by_live_claim() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();
        let dev = &fixture.devices[0];

        repo.create(&session(dev, 1, vec![])).await.unwrap();
        let claim = repo.get_for_update(dev, 1).await.unwrap();

        let mut row = claim.items()[0].clone();
        row.mark_provisioned(Utc::now());
        let err = repo.update(&row, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = repo.update(&row, Some("someone-else")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!repo.get(dev, 1).await.unwrap().state_provisioned);

        repo.update(&row, Some(claim.token())).await.unwrap();
        assert!(repo.get(dev, 1).await.unwrap().state_provisioned);
        assert!(repo.get_for_update(dev, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_invalid_session() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 1).await;
        let repo = db.fragmentation_sessions();

        let err = repo
            .create(&session(&fixture.devices[0], 0, vec![1, 1]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let mut bad = session(&fixture.devices[0], 0, vec![]);
        bad.descriptor = vec![0; 3];
        assert_eq!(repo.create(&bad).await.unwrap_err().kind(), ErrorKind::Invalid);
    }
}
